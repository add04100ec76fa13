/// Multi-path consensus aggregation
///
/// Takes the alternative answers produced by independent reasoning paths and
/// reduces them to a single consensus answer. Stateless: a pure function
/// over its inputs.
///
/// Answers are normalized, clustered by word overlap, and each cluster is
/// scored by average path confidence weighted by support, a consensus boost
/// for majorities, an outlier penalty for singletons, and a diversity bonus
/// for clusters whose paths took structurally different routes.
use crate::types::AssociationType;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

/// Word-Jaccard threshold for joining an existing cluster
const SIMILARITY_THRESHOLD: f32 = 0.8;

static PUNCTUATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s]").expect("static regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));

/// One reasoning outcome: a candidate answer (extracted externally from the
/// terminal concept of a path) plus the path's confidence and the sequence
/// of edge types it traversed.
#[derive(Debug, Clone)]
pub struct AnswerPath {
    pub answer: Vec<u8>,
    pub confidence: f32,
    pub edge_types: Vec<AssociationType>,
}

impl AnswerPath {
    pub fn new(answer: impl Into<Vec<u8>>, confidence: f32, edge_types: Vec<AssociationType>) -> Self {
        Self {
            answer: answer.into(),
            confidence,
            edge_types,
        }
    }
}

/// Winning cluster summary
#[derive(Debug, Clone, PartialEq)]
pub struct Consensus {
    /// Normalized representative answer of the winning cluster
    pub answer: String,
    /// Final cluster weight
    pub weight: f32,
    /// Support of the winning cluster: members / total answers
    pub consensus_strength: f32,
    /// Average path confidence within the winning cluster
    pub mean_confidence: f32,
    pub cluster_size: usize,
    pub total_answers: usize,
}

/// Lowercase, strip punctuation, collapse whitespace
pub fn normalize_answer(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw).to_lowercase();
    let stripped = PUNCTUATION.replace_all(&text, "");
    WHITESPACE.replace_all(stripped.trim(), " ").into_owned()
}

fn word_set(normalized: &str) -> HashSet<&str> {
    normalized.split(' ').filter(|w| !w.is_empty()).collect()
}

fn word_jaccard(a: &HashSet<&str>, b: &HashSet<&str>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f32;
    let union = a.union(b).count() as f32;
    intersection / union
}

struct Cluster {
    representative: String,
    member_indices: Vec<usize>,
}

/// Aggregate alternative reasoning outputs into one consensus answer.
/// Returns `None` for an empty input set.
pub fn aggregate_paths(answers: &[AnswerPath]) -> Option<Consensus> {
    if answers.is_empty() {
        return None;
    }

    let normalized: Vec<String> = answers.iter().map(|a| normalize_answer(&a.answer)).collect();

    // Greedy clustering: each answer joins the first cluster whose
    // representative it resembles, else starts a new one
    let mut clusters: Vec<Cluster> = Vec::new();
    for (idx, norm) in normalized.iter().enumerate() {
        let words = word_set(norm);
        let home = clusters
            .iter_mut()
            .find(|c| word_jaccard(&words, &word_set(&c.representative)) >= SIMILARITY_THRESHOLD);

        match home {
            Some(cluster) => cluster.member_indices.push(idx),
            None => clusters.push(Cluster {
                representative: norm.clone(),
                member_indices: vec![idx],
            }),
        }
    }

    let total = answers.len();
    let mut winner: Option<(f32, Consensus)> = None;

    for cluster in &clusters {
        let members = cluster.member_indices.len();
        let mean_confidence = cluster
            .member_indices
            .iter()
            .map(|&i| answers[i].confidence)
            .sum::<f32>()
            / members as f32;

        let support = members as f32 / total as f32;

        let consensus_boost = if members >= 2 {
            1.0 + (support - 0.5).max(0.0)
        } else {
            1.0
        };

        let outlier_penalty = if members == 1 && total > 1 { 0.7 } else { 1.0 };

        // Distinct edge-type sequences within the cluster
        let unique_patterns = cluster
            .member_indices
            .iter()
            .map(|&i| answers[i].edge_types.as_slice())
            .collect::<HashSet<_>>()
            .len();
        let diversity_bonus = 1.0 + 0.2 * (unique_patterns as f32 / 4.0).min(1.0);

        let weight = mean_confidence * support * consensus_boost * outlier_penalty * diversity_bonus;

        log::debug!(
            "cluster '{}': members={} support={:.2} boost={:.2} penalty={:.2} diversity={:.2} weight={:.3}",
            cluster.representative,
            members,
            support,
            consensus_boost,
            outlier_penalty,
            diversity_bonus,
            weight
        );

        let candidate = Consensus {
            answer: cluster.representative.clone(),
            weight,
            consensus_strength: support,
            mean_confidence,
            cluster_size: members,
            total_answers: total,
        };

        match &winner {
            Some((best_weight, _)) if *best_weight >= weight => {}
            _ => winner = Some((weight, candidate)),
        }
    }

    winner.map(|(_, consensus)| consensus)
}
