//! TF-IDF + k-means grouping of comment text into persona seeds.

use crate::similarity::l2_normalize;
use crate::stopwords::is_stopword;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

pub const DEFAULT_SEED: u64 = 42;
const DEFAULT_MAX_ITERATIONS: usize = 100;
const DEFAULT_RESTARTS: usize = 10;

#[derive(Debug, Clone)]
pub struct TextClusterer {
    seed: u64,
    max_iterations: usize,
    /// Independent k-means++ runs; the one with the lowest inertia wins.
    restarts: usize,
}

impl Default for TextClusterer {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            restarts: DEFAULT_RESTARTS,
        }
    }
}

impl TextClusterer {
    pub fn new(seed: u64, max_iterations: usize, restarts: usize) -> Self {
        Self {
            seed,
            max_iterations: max_iterations.max(1),
            restarts: restarts.max(1),
        }
    }

    /// Groups `sentences` into `min(len, num_clusters)` non-empty clusters keyed by
    /// cluster id.
    ///
    /// With fewer sentences than clusters every sentence becomes its own cluster.
    /// Sentence order is preserved within each group.
    pub fn cluster(&self, sentences: &[String], num_clusters: usize) -> BTreeMap<usize, Vec<String>> {
        if sentences.is_empty() {
            return BTreeMap::new();
        }

        let num_clusters = num_clusters.max(1);
        if sentences.len() < num_clusters {
            debug!(
                "{} sentences for {} clusters, using singletons",
                sentences.len(),
                num_clusters
            );
            return sentences
                .iter()
                .cloned()
                .enumerate()
                .map(|(i, s)| (i, vec![s]))
                .collect();
        }

        let vectors = tfidf_vectors(sentences);
        let mut rng = fastrand::Rng::with_seed(self.seed);
        let mut best: Option<(Vec<usize>, f32)> = None;
        for _ in 0..self.restarts {
            let (assignments, inertia) = self.kmeans(&vectors, num_clusters, &mut rng);
            if best.as_ref().map_or(true, |(_, lowest)| inertia < *lowest) {
                best = Some((assignments, inertia));
            }
        }
        let assignments = best.map(|(a, _)| a).unwrap_or_default();

        let mut groups: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for (sentence, cluster_id) in sentences.iter().zip(assignments) {
            groups.entry(cluster_id).or_default().push(sentence.clone());
        }

        debug!(
            "Clustered {} sentences into {} groups",
            sentences.len(),
            groups.len()
        );
        groups
    }

    fn kmeans(&self, vectors: &[Vec<f32>], k: usize, rng: &mut fastrand::Rng) -> (Vec<usize>, f32) {
        let mut centers = kmeans_plus_plus(vectors, k, rng);
        let dim = vectors.first().map(Vec::len).unwrap_or(0);
        let mut assignments = vec![usize::MAX; vectors.len()];

        for _ in 0..self.max_iterations {
            let mut changed = false;
            for (i, vector) in vectors.iter().enumerate() {
                let nearest = nearest_center(vector, &centers).0;
                if assignments[i] != nearest {
                    assignments[i] = nearest;
                    changed = true;
                }
            }
            if fill_empty_clusters(vectors, &mut assignments, &centers) {
                changed = true;
            }
            if !changed {
                break;
            }

            let mut sums = vec![vec![0.0f32; dim]; centers.len()];
            let mut counts = vec![0usize; centers.len()];
            for (vector, &cluster_id) in vectors.iter().zip(&assignments) {
                counts[cluster_id] += 1;
                for (sum, value) in sums[cluster_id].iter_mut().zip(vector) {
                    *sum += value;
                }
            }
            for (cluster_id, sum) in sums.into_iter().enumerate() {
                // Only empty when there are fewer vectors than centers.
                if counts[cluster_id] > 0 {
                    let n = counts[cluster_id] as f32;
                    centers[cluster_id] = sum.into_iter().map(|x| x / n).collect();
                }
            }
        }

        let inertia = vectors
            .iter()
            .zip(&assignments)
            .map(|(vector, &cluster_id)| squared_distance(vector, &centers[cluster_id]))
            .sum();
        (assignments, inertia)
    }
}

/// Groups with the default seed.
pub fn cluster(sentences: &[String], num_clusters: usize) -> BTreeMap<usize, Vec<String>> {
    TextClusterer::default().cluster(sentences, num_clusters)
}

/// Lowercased tokens of two or more word characters, stopwords removed.
fn analyze(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| t.chars().count() >= 2 && !is_stopword(t))
        .map(str::to_string)
        .collect()
}

/// Rows are L2-normalized; idf is smoothed as `ln((1 + n) / (1 + df)) + 1`.
fn tfidf_vectors(sentences: &[String]) -> Vec<Vec<f32>> {
    let documents: Vec<Vec<String>> = sentences.iter().map(|s| analyze(s)).collect();

    let mut vocabulary: BTreeMap<&str, usize> = BTreeMap::new();
    for token in documents.iter().flatten() {
        vocabulary.entry(token.as_str()).or_insert(0);
    }
    for (index, slot) in vocabulary.values_mut().enumerate() {
        *slot = index;
    }

    let mut document_frequency = vec![0usize; vocabulary.len()];
    for document in &documents {
        let mut seen: Vec<usize> = document.iter().map(|t| vocabulary[t.as_str()]).collect();
        seen.sort_unstable();
        seen.dedup();
        for index in seen {
            document_frequency[index] += 1;
        }
    }

    let n = documents.len() as f32;
    let idf: Vec<f32> = document_frequency
        .iter()
        .map(|&df| ((1.0 + n) / (1.0 + df as f32)).ln() + 1.0)
        .collect();

    documents
        .iter()
        .map(|document| {
            let mut counts: HashMap<usize, f32> = HashMap::new();
            for token in document {
                *counts.entry(vocabulary[token.as_str()]).or_insert(0.0) += 1.0;
            }
            let mut row = vec![0.0f32; vocabulary.len()];
            for (index, count) in counts {
                row[index] = count * idf[index];
            }
            l2_normalize(&mut row);
            row
        })
        .collect()
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn nearest_center(vector: &[f32], centers: &[Vec<f32>]) -> (usize, f32) {
    centers
        .iter()
        .enumerate()
        .map(|(i, center)| (i, squared_distance(vector, center)))
        .fold((0, f32::INFINITY), |best, candidate| {
            if candidate.1 < best.1 {
                candidate
            } else {
                best
            }
        })
}

/// Gives every empty cluster the point farthest from its own center, taken from a
/// cluster that keeps at least one member. Returns whether any point moved.
fn fill_empty_clusters(
    vectors: &[Vec<f32>],
    assignments: &mut [usize],
    centers: &[Vec<f32>],
) -> bool {
    let mut counts = vec![0usize; centers.len()];
    for &cluster_id in assignments.iter() {
        counts[cluster_id] += 1;
    }

    let mut moved = false;
    for empty in 0..centers.len() {
        if counts[empty] > 0 {
            continue;
        }
        let farthest = vectors
            .iter()
            .enumerate()
            .filter(|(i, _)| counts[assignments[*i]] > 1)
            .map(|(i, vector)| (i, squared_distance(vector, &centers[assignments[i]])))
            .fold(None, |best: Option<(usize, f32)>, candidate| match best {
                Some(best) if best.1 >= candidate.1 => Some(best),
                _ => Some(candidate),
            });
        let Some((index, _)) = farthest else {
            break;
        };
        counts[assignments[index]] -= 1;
        assignments[index] = empty;
        counts[empty] += 1;
        moved = true;
    }
    moved
}

fn kmeans_plus_plus(vectors: &[Vec<f32>], k: usize, rng: &mut fastrand::Rng) -> Vec<Vec<f32>> {
    let mut chosen = vec![rng.usize(..vectors.len())];

    while chosen.len() < k {
        let centers: Vec<Vec<f32>> = chosen.iter().map(|&i| vectors[i].clone()).collect();
        let weights: Vec<f32> = vectors
            .iter()
            .map(|v| nearest_center(v, &centers).1)
            .collect();
        let total: f32 = weights.iter().sum();

        let next = if total > 0.0 {
            let mut target = rng.f32() * total;
            let mut pick = vectors.len() - 1;
            for (i, weight) in weights.iter().enumerate() {
                if *weight <= 0.0 {
                    continue;
                }
                if target < *weight {
                    pick = i;
                    break;
                }
                target -= weight;
            }
            pick
        } else {
            // Every point coincides with a center; take any unused index.
            let unused: Vec<usize> = (0..vectors.len()).filter(|i| !chosen.contains(i)).collect();
            unused[rng.usize(..unused.len())]
        };
        chosen.push(next);
    }

    chosen.into_iter().map(|i| vectors[i].clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentences(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_fewer_sentences_than_clusters_yields_singletons() {
        let input = sentences(&["I love cheap laptops", "RAM matters more than CPU"]);

        let groups = cluster(&input, 10);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&0], vec![input[0].clone()]);
        assert_eq!(groups[&1], vec![input[1].clone()]);
    }

    #[test]
    fn test_empty_input() {
        assert!(cluster(&[], 3).is_empty());
    }

    #[test]
    fn test_single_cluster_keeps_order() {
        let input = sentences(&["first thought", "second thought", "third thought"]);

        let groups = cluster(&input, 1);

        assert_eq!(groups.len(), 1);
        assert_eq!(groups.values().next().unwrap(), &input);
    }

    #[test]
    fn test_separates_topics() {
        let input = sentences(&[
            "budget laptop battery life",
            "sourdough bread starter recipe",
            "laptop battery budget pick",
            "bread recipe sourdough flour",
            "cheap laptop battery",
            "sourdough bread baking",
        ]);

        let groups = cluster(&input, 2);

        assert_eq!(groups.len(), 2);
        let total: usize = groups.values().map(Vec::len).sum();
        assert_eq!(total, input.len());
        for group in groups.values() {
            let laptops = group.iter().filter(|s| s.contains("laptop")).count();
            assert!(laptops == 0 || laptops == group.len());
        }
    }

    #[test]
    fn test_deterministic_with_fixed_seed() {
        let input = sentences(&[
            "gpu prices are insane",
            "prices for gpus dropped",
            "my cat sleeps all day",
            "cats love boxes",
            "mechanical keyboards are loud",
            "keyboard switches matter",
        ]);

        let first = cluster(&input, 3);
        let second = cluster(&input, 3);

        assert_eq!(first, second);
    }

    #[test]
    fn test_analyze_drops_stopwords_and_short_tokens() {
        assert_eq!(
            analyze("I think THE laptop is a 10/10 x"),
            vec!["think".to_string(), "laptop".to_string(), "10".to_string(), "10".to_string()]
        );
    }

    #[test]
    fn test_identical_sentences_still_fill_every_cluster() {
        let input = sentences(&["same words here", "same words here", "same words here"]);

        let groups = cluster(&input, 2);

        assert_eq!(groups.len(), 2);
        let total: usize = groups.values().map(Vec::len).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn test_cluster_count_matches_request() {
        let input = sentences(&[
            "budget laptop battery life",
            "budget laptop battery life",
            "budget laptop battery life",
            "sourdough bread starter",
            "mechanical keyboard switches",
        ]);

        for k in 1..=input.len() {
            let groups = cluster(&input, k);
            assert_eq!(groups.len(), k);
            assert!(groups.values().all(|group| !group.is_empty()));
        }
    }

    #[test]
    fn test_fill_empty_clusters_moves_farthest_point() {
        let vectors = vec![vec![0.0, 0.0], vec![0.1, 0.0], vec![3.0, 0.0]];
        let centers = vec![vec![0.0, 0.0], vec![10.0, 10.0], vec![-10.0, -10.0]];
        let mut assignments = vec![0, 0, 0];

        assert!(fill_empty_clusters(&vectors, &mut assignments, &centers));

        // Farthest from center 0 goes first, then the next farthest.
        assert_eq!(assignments, vec![0, 2, 1]);
        assert!(!fill_empty_clusters(&vectors, &mut assignments, &centers));
    }
}
