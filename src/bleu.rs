//! Self-contained sentence-level BLEU: brevity penalty times the geometric
//! mean of clipped n-gram precisions (n = 1..4), scaled to 0-100.

use std::collections::HashMap;

fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace().map(|t| t.to_lowercase()).collect()
}

fn ngram_counts(tokens: &[String], n: usize) -> HashMap<Vec<String>, usize> {
    let mut counts = HashMap::new();
    if tokens.len() < n {
        return counts;
    }
    for window in tokens.windows(n) {
        *counts.entry(window.to_vec()).or_insert(0) += 1;
    }
    counts
}

/// Sentence-level BLEU of `candidate` against one or more `references`,
/// returned as a 0-100 score.
pub fn sentence_bleu(candidate: &str, references: &[&str]) -> f64 {
    let cand_tokens = tokenize(candidate);
    if cand_tokens.is_empty() {
        return 0.0;
    }
    let ref_token_lists: Vec<Vec<String>> = references.iter().map(|r| tokenize(r)).collect();

    let max_n = cand_tokens.len().min(4);
    let mut log_precision_sum = 0.0;
    let mut orders_used = 0u32;

    for n in 1..=max_n {
        let cand_ngrams = ngram_counts(&cand_tokens, n);
        if cand_ngrams.is_empty() {
            continue;
        }

        let mut max_ref_counts: HashMap<Vec<String>, usize> = HashMap::new();
        for ref_tokens in &ref_token_lists {
            for (gram, count) in ngram_counts(ref_tokens, n) {
                let entry = max_ref_counts.entry(gram).or_insert(0);
                *entry = (*entry).max(count);
            }
        }

        let mut clipped = 0usize;
        let mut total = 0usize;
        for (gram, count) in &cand_ngrams {
            total += count;
            let allowed = max_ref_counts.get(gram).copied().unwrap_or(0);
            clipped += (*count).min(allowed);
        }
        if total == 0 {
            continue;
        }

        // Epsilon smoothing avoids an outright zero collapsing the whole
        // geometric mean when one order has no overlap at all.
        let precision = (clipped as f64 / total as f64).max(1e-9);
        log_precision_sum += precision.ln();
        orders_used += 1;
    }

    if orders_used == 0 {
        return 0.0;
    }

    let geometric_mean = (log_precision_sum / orders_used as f64).exp();

    let cand_len = cand_tokens.len();
    let closest_ref_len = ref_token_lists
        .iter()
        .map(|r| r.len())
        .min_by_key(|len| (*len as i64 - cand_len as i64).abs())
        .unwrap_or(cand_len);

    let brevity_penalty = if closest_ref_len == 0 || cand_len >= closest_ref_len {
        1.0
    } else {
        (1.0 - closest_ref_len as f64 / cand_len as f64).exp()
    };

    (geometric_mean * brevity_penalty * 100.0).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_sentence_scores_one_hundred() {
        let score = sentence_bleu("fix typo", &["Fix typo"]);
        assert!((score - 100.0).abs() < 1e-6, "expected ~100, got {score}");
    }

    #[test]
    fn completely_disjoint_sentence_scores_near_zero() {
        let score = sentence_bleu("completely unrelated words here", &["Fix typo"]);
        assert!(score < 5.0, "expected near zero, got {score}");
    }

    #[test]
    fn partial_overlap_scores_between_bounds() {
        let score = sentence_bleu("fix the typo", &["fix typo"]);
        assert!(score > 0.0 && score < 100.0, "expected partial score, got {score}");
    }

    #[test]
    fn empty_candidate_scores_zero() {
        assert_eq!(sentence_bleu("", &["fix typo"]), 0.0);
    }

    #[test]
    fn picks_best_reference_among_several() {
        let exact = sentence_bleu("fix typo", &["completely different", "fix typo"]);
        assert!((exact - 100.0).abs() < 1e-6);
    }
}
