use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    config::SegmenterConfig,
    error::Result,
    format::{format_timestamp, format_transcript_with_timestamps},
    llm::{LanguageModel, SchemaHint, extract_json},
    types::{Module, ModuleStatus, Transcript, TranscriptSegment},
};

/// A module start proposed by the provider (or by the fixed-window fallback).
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub start_ms: u64,
    pub title: Option<String>,
    pub key_concepts: Vec<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
struct Candidate {
    start_ms: u64,
    end_ms: u64,
    title: Option<String>,
    key_concepts: BTreeSet<String>,
    /// Confidence of the boundary at `start_ms`.
    confidence: f64,
}

impl Candidate {
    fn duration_ms(&self) -> u64 {
        self.end_ms - self.start_ms
    }
}

#[derive(Deserialize)]
struct RawProposal {
    start_ms: Option<f64>,
    title: Option<String>,
    #[serde(default)]
    key_concepts: Vec<String>,
    confidence: Option<f64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawProposals {
    Wrapped { modules: Vec<RawProposal> },
    Bare(Vec<RawProposal>),
}

pub struct ModuleSegmenter {
    llm: Arc<dyn LanguageModel>,
    config: SegmenterConfig,
}

impl ModuleSegmenter {
    pub fn new(llm: Arc<dyn LanguageModel>, config: SegmenterConfig) -> Self {
        Self { llm, config }
    }

    /// Splits the transcript into modules that partition its time range.
    pub async fn segment(&self, transcript: &Transcript) -> Result<Vec<Module>> {
        let mut proposals = Vec::new();

        for window in windows(&transcript.segments, self.config.window_chars) {
            let prompt = window_prompt(window);
            let content = self
                .llm
                .generate(&prompt, SchemaHint::ModuleBoundaries)
                .await?;

            match parse_proposals(&content) {
                Ok(found) => {
                    debug!(
                        video_id = transcript.video_id.as_str(),
                        proposals = found.len(),
                        "Boundary proposals received"
                    );
                    proposals.extend(found);
                }
                Err(reason) => {
                    warn!(
                        video_id = transcript.video_id.as_str(),
                        reason, "Unusable boundary proposal, falling back to fixed windows"
                    );
                    proposals.extend(fixed_window_proposals(
                        window,
                        self.config.fallback_chunk.as_millis() as u64,
                    ));
                }
            }
        }

        Ok(plan_modules(transcript, proposals, &self.config))
    }
}

/// Consecutive runs of segments whose text fits in `max_chars` (at least one segment each).
fn windows(segments: &[TranscriptSegment], max_chars: usize) -> Vec<&[TranscriptSegment]> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = 0;

    for (i, seg) in segments.iter().enumerate() {
        let len = seg.text.len();
        if i > start && chars + len > max_chars {
            out.push(&segments[start..i]);
            start = i;
            chars = 0;
        }
        chars += len;
    }
    if start < segments.len() {
        out.push(&segments[start..]);
    }
    out
}

fn window_prompt(window: &[TranscriptSegment]) -> String {
    let first = window.first().map(|s| s.start_ms).unwrap_or(0);
    let last = window.last().map(|s| s.end_ms).unwrap_or(0);
    format!(
        "Transcript window from {} to {} (start_ms {}..{}).\n\
         Propose where learning modules start inside this window, at points where the topic shifts.\n\n{}",
        format_timestamp(first),
        format_timestamp(last),
        first,
        last,
        format_transcript_with_timestamps(window)
    )
}

pub fn parse_proposals(content: &str) -> std::result::Result<Vec<Proposal>, String> {
    let json = extract_json(content).ok_or("no JSON in provider output")?;
    let raw: RawProposals =
        serde_json::from_str(json).map_err(|e| format!("malformed boundary JSON: {e}"))?;
    let raw = match raw {
        RawProposals::Wrapped { modules } => modules,
        RawProposals::Bare(modules) => modules,
    };

    let proposals: Vec<Proposal> = raw
        .into_iter()
        .filter_map(|p| {
            let start = p.start_ms.filter(|s| s.is_finite() && *s >= 0.0)?;
            Some(Proposal {
                start_ms: start as u64,
                title: p.title,
                key_concepts: p.key_concepts,
                confidence: p.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
            })
        })
        .collect();

    if proposals.is_empty() {
        return Err("no module starts in provider output".to_string());
    }
    Ok(proposals)
}

fn fixed_window_proposals(window: &[TranscriptSegment], chunk_ms: u64) -> Vec<Proposal> {
    let (Some(first), Some(last)) = (window.first(), window.last()) else {
        return Vec::new();
    };
    let chunk_ms = chunk_ms.max(1);

    (first.start_ms..last.end_ms.max(first.start_ms + 1))
        .step_by(chunk_ms as usize)
        .map(|start_ms| Proposal {
            start_ms,
            title: None,
            key_concepts: Vec::new(),
            confidence: 0.0,
        })
        .collect()
}

/// Segment start closest to `ms`; ties go to the earlier start.
fn snap(segments: &[TranscriptSegment], ms: u64) -> u64 {
    segments
        .iter()
        .map(|s| s.start_ms)
        .min_by_key(|start| (start.abs_diff(ms), *start))
        .unwrap_or(ms)
}

fn normalize_concepts(raw: &[String]) -> BTreeSet<String> {
    raw.iter()
        .map(|c| c.trim().to_lowercase())
        .filter(|c| !c.is_empty())
        .collect()
}

/// Turns proposals into modules: snap to segment starts, merge modules shorter than the
/// minimum, then merge the weakest boundaries until the count cap holds.
pub fn plan_modules(
    transcript: &Transcript,
    proposals: Vec<Proposal>,
    config: &SegmenterConfig,
) -> Vec<Module> {
    let range_start = transcript.start_ms();
    let range_end = transcript.end_ms();

    let mut starts: BTreeMap<u64, Candidate> = BTreeMap::new();
    for proposal in proposals {
        let start_ms = snap(&transcript.segments, proposal.start_ms);
        if start_ms >= range_end && start_ms != range_start {
            continue;
        }
        let concepts = normalize_concepts(&proposal.key_concepts);
        let entry = starts.entry(start_ms).or_insert_with(|| Candidate {
            start_ms,
            end_ms: start_ms,
            title: None,
            key_concepts: BTreeSet::new(),
            confidence: f64::MIN,
        });
        if proposal.confidence > entry.confidence {
            entry.confidence = proposal.confidence;
            if proposal.title.is_some() {
                entry.title = proposal.title;
            }
        } else if entry.title.is_none() {
            entry.title = proposal.title;
        }
        entry.key_concepts.extend(concepts);
    }
    starts.entry(range_start).or_insert_with(|| Candidate {
        start_ms: range_start,
        end_ms: range_start,
        title: None,
        key_concepts: BTreeSet::new(),
        confidence: 1.0,
    });

    let mut candidates: Vec<Candidate> = starts.into_values().collect();
    let ends: Vec<u64> = candidates
        .iter()
        .skip(1)
        .map(|c| c.start_ms)
        .chain(std::iter::once(range_end))
        .collect();
    for (candidate, end_ms) in candidates.iter_mut().zip(ends) {
        candidate.end_ms = end_ms;
    }

    merge_short(&mut candidates, config.min_module_duration.as_millis() as u64);
    cap_count(&mut candidates, config.max_modules);

    candidates
        .into_iter()
        .enumerate()
        .map(|(i, c)| {
            let text = transcript.text_between(c.start_ms, c.end_ms);
            let title = c
                .title
                .as_deref()
                .and_then(normalize_title)
                .unwrap_or_else(|| fallback_title(&text, i));
            Module {
                video_id: transcript.video_id.clone(),
                module_index: i as u32,
                title,
                start_ms: c.start_ms,
                end_ms: c.end_ms,
                key_concepts: c.key_concepts,
                status: ModuleStatus::NotStarted,
            }
        })
        .collect()
}

/// Joins `candidates[i]` with `candidates[i + 1]`.
fn merge_at(candidates: &mut Vec<Candidate>, i: usize) {
    let right = candidates.remove(i + 1);
    let left = &mut candidates[i];
    if right.duration_ms() > left.duration_ms() && right.title.is_some() {
        left.title = right.title;
    }
    left.end_ms = right.end_ms;
    left.key_concepts.extend(right.key_concepts);
}

fn merge_short(candidates: &mut Vec<Candidate>, min_ms: u64) {
    while candidates.len() > 1 {
        let Some(i) = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.duration_ms() < min_ms)
            .min_by_key(|(_, c)| (c.duration_ms(), c.start_ms))
            .map(|(i, _)| i)
        else {
            break;
        };

        let overlap = |j: usize| {
            candidates[i]
                .key_concepts
                .intersection(&candidates[j].key_concepts)
                .count()
        };
        let previous = i.checked_sub(1);
        let next = (i + 1 < candidates.len()).then_some(i + 1);
        let neighbor = match (previous, next) {
            (Some(p), Some(n)) if overlap(n) < overlap(p) => n,
            (Some(p), _) => p,
            (None, Some(n)) => n,
            (None, None) => break,
        };

        merge_at(candidates, i.min(neighbor));
    }
}

fn cap_count(candidates: &mut Vec<Candidate>, max_modules: usize) {
    let max_modules = max_modules.max(1);
    while candidates.len() > max_modules {
        let Some(weakest) = (1..candidates.len()).min_by(|&a, &b| {
            candidates[a]
                .confidence
                .total_cmp(&candidates[b].confidence)
                .then(candidates[a].start_ms.cmp(&candidates[b].start_ms))
        }) else {
            break;
        };
        merge_at(candidates, weakest - 1);
    }
}

fn normalize_title(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_end_matches(['.', '!', '?']).trim();
    if trimmed.is_empty() {
        return None;
    }
    let title = trimmed
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ");
    Some(title)
}

fn fallback_title(text: &str, index: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    match words.len() {
        0 => format!("Module {}", index + 1),
        n if n > 10 => format!("{}...", words[..10].join(" ")),
        _ => words.join(" "),
    }
}

/// Text handed to the quiz generator: the module title, then the module's transcript span.
pub fn module_text(transcript: &Transcript, module: &Module) -> String {
    let body = transcript.text_between(module.start_ms, module.end_ms);
    if body.is_empty() {
        module.title.clone()
    } else {
        format!("{}\n\n{}", module.title, body)
    }
}
