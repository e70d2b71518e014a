//! CART (Classification and Regression Tree) builder
//!
//! Exact-greedy tree construction over a bootstrap sample. Regression trees
//! minimise the within-node squared error, classification trees the Gini
//! impurity. Candidate features are visited in a seeded random order.

use serde::{Deserialize, Serialize};

use crate::deterministic::LcgRng;

const IMPURITY_EPSILON: f64 = 1e-12;

/// Node split criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Criterion {
    /// Variance reduction; leaves hold the mean target.
    SquaredError,
    /// Gini decrease over `n_classes` labels; leaves hold a class index.
    Gini { n_classes: usize },
}

/// Training parameters for a single tree
#[derive(Clone, Debug)]
pub struct TreeConfig {
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// Number of features examined per split.
    pub max_features: usize,
    pub criterion: Criterion,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: usize::MAX,
            criterion: Criterion::SquaredError,
        }
    }
}

/// A tree node. Leaves carry `value`; internal nodes route
/// `x[feature_index] <= threshold` to `left`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub feature_index: usize,
    pub threshold: f64,
    pub left: u32,
    pub right: u32,
    pub value: Option<f64>,
}

impl Node {
    fn leaf(value: f64) -> Self {
        Self {
            feature_index: 0,
            threshold: 0.0,
            left: 0,
            right: 0,
            value: Some(value),
        }
    }
}

/// A fitted decision tree, nodes indexed by position with the root at 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<Node>,
}

impl Tree {
    pub fn predict(&self, features: &[f64]) -> f64 {
        let mut idx = 0usize;
        while let Some(node) = self.nodes.get(idx) {
            if let Some(value) = node.value {
                return value;
            }
            let x = features.get(node.feature_index).copied().unwrap_or(0.0);
            idx = if x <= node.threshold {
                node.left as usize
            } else {
                node.right as usize
            };
        }
        0.0
    }

    pub fn leaf_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.value.is_some()).count()
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], idx: usize) -> usize {
            match nodes.get(idx) {
                Some(node) if node.value.is_none() => {
                    1 + walk(nodes, node.left as usize).max(walk(nodes, node.right as usize))
                }
                _ => 0,
            }
        }
        walk(&self.nodes, 0)
    }
}

/// Running sufficient statistics for a set of targets.
#[derive(Clone, Debug)]
struct NodeStats {
    count: f64,
    sum: f64,
    sum_sq: f64,
    class_counts: Vec<f64>,
}

impl NodeStats {
    fn empty(criterion: Criterion) -> Self {
        let n_classes = match criterion {
            Criterion::Gini { n_classes } => n_classes,
            Criterion::SquaredError => 0,
        };
        Self {
            count: 0.0,
            sum: 0.0,
            sum_sq: 0.0,
            class_counts: vec![0.0; n_classes],
        }
    }

    fn add(&mut self, y: f64) {
        self.count += 1.0;
        self.sum += y;
        self.sum_sq += y * y;
        if let Some(c) = self.class_counts.get_mut(y as usize) {
            *c += 1.0;
        }
    }

    fn remove(&mut self, y: f64) {
        self.count -= 1.0;
        self.sum -= y;
        self.sum_sq -= y * y;
        if let Some(c) = self.class_counts.get_mut(y as usize) {
            *c -= 1.0;
        }
    }

    /// Impurity multiplied by the sample count.
    fn weighted_impurity(&self, criterion: Criterion) -> f64 {
        if self.count <= 0.0 {
            return 0.0;
        }
        let value = match criterion {
            Criterion::SquaredError => self.sum_sq - self.sum * self.sum / self.count,
            Criterion::Gini { .. } => {
                let sq: f64 = self.class_counts.iter().map(|c| c * c).sum();
                self.count - sq / self.count
            }
        };
        value.max(0.0)
    }

    fn leaf_value(&self, criterion: Criterion) -> f64 {
        match criterion {
            Criterion::SquaredError if self.count > 0.0 => self.sum / self.count,
            Criterion::SquaredError => 0.0,
            Criterion::Gini { .. } => {
                // Lowest class index wins ties.
                let mut best = 0usize;
                for (idx, &count) in self.class_counts.iter().enumerate() {
                    if count > self.class_counts[best] {
                        best = idx;
                    }
                }
                best as f64
            }
        }
    }
}

#[derive(Debug, Clone)]
struct SplitCandidate {
    feature_idx: usize,
    threshold: f64,
    gain: f64,
}

struct BuildState<'r> {
    nodes: Vec<Node>,
    importances: Vec<f64>,
    rng: &'r mut LcgRng,
}

/// Builds one tree over a (possibly repeating) set of row indices.
pub struct CartBuilder<'a> {
    config: TreeConfig,
    features: &'a [Vec<f64>],
    targets: &'a [f64],
    feature_count: usize,
}

impl<'a> CartBuilder<'a> {
    pub fn new(features: &'a [Vec<f64>], targets: &'a [f64], config: TreeConfig) -> Self {
        let feature_count = features.first().map_or(0, Vec::len);
        Self {
            config,
            features,
            targets,
            feature_count,
        }
    }

    /// Build the tree and return it with its raw (unnormalised) impurity
    /// decrease per feature.
    pub fn build(&self, indices: &[usize], rng: &mut LcgRng) -> (Tree, Vec<f64>) {
        let mut state = BuildState {
            nodes: Vec::new(),
            importances: vec![0.0; self.feature_count],
            rng,
        };
        self.build_node(indices, 0, &mut state);
        (Tree { nodes: state.nodes }, state.importances)
    }

    fn stats(&self, indices: &[usize]) -> NodeStats {
        let mut stats = NodeStats::empty(self.config.criterion);
        for &idx in indices {
            stats.add(self.targets[idx]);
        }
        stats
    }

    fn build_node(&self, indices: &[usize], depth: usize, state: &mut BuildState<'_>) -> u32 {
        let current_idx = state.nodes.len() as u32;
        let criterion = self.config.criterion;
        let stats = self.stats(indices);
        let leaf_value = stats.leaf_value(criterion);
        let parent_impurity = stats.weighted_impurity(criterion);

        let depth_reached = self.config.max_depth.is_some_and(|max| depth >= max);
        if depth_reached
            || indices.len() < self.config.min_samples_split
            || indices.len() < 2 * self.config.min_samples_leaf
            || parent_impurity <= IMPURITY_EPSILON
        {
            state.nodes.push(Node::leaf(leaf_value));
            return current_idx;
        }

        let Some(split) = self.find_best_split(indices, &stats, state.rng) else {
            state.nodes.push(Node::leaf(leaf_value));
            return current_idx;
        };

        let (left_indices, right_indices) =
            self.split_samples(indices, split.feature_idx, split.threshold);

        state.importances[split.feature_idx] += split.gain;

        // Reserve space for current node
        state.nodes.push(Node {
            feature_index: split.feature_idx,
            threshold: split.threshold,
            left: 0,
            right: 0,
            value: None,
        });

        let left_idx = self.build_node(&left_indices, depth + 1, state);
        let right_idx = self.build_node(&right_indices, depth + 1, state);

        let node = &mut state.nodes[current_idx as usize];
        node.left = left_idx;
        node.right = right_idx;

        current_idx
    }

    /// Exact-greedy search over a random subset of features. Features that
    /// are constant within the node do not count towards `max_features`.
    fn find_best_split(
        &self,
        indices: &[usize],
        parent: &NodeStats,
        rng: &mut LcgRng,
    ) -> Option<SplitCandidate> {
        let criterion = self.config.criterion;
        let parent_impurity = parent.weighted_impurity(criterion);
        let min_leaf = self.config.min_samples_leaf.max(1);

        let mut order: Vec<usize> = (0..self.feature_count).collect();
        rng.shuffle(&mut order);

        let mut best: Option<SplitCandidate> = None;
        let mut visited = 0usize;
        let mut sorted = indices.to_vec();

        for feature_idx in order {
            if visited >= self.config.max_features && best.is_some() {
                break;
            }

            sorted.sort_by(|&a, &b| {
                self.features[a][feature_idx].total_cmp(&self.features[b][feature_idx])
            });
            let first = self.features[sorted[0]][feature_idx];
            let last = self.features[sorted[sorted.len() - 1]][feature_idx];
            if first == last {
                continue;
            }
            visited += 1;

            let mut left = NodeStats::empty(criterion);
            let mut right = parent.clone();

            for pos in 0..sorted.len() - 1 {
                let y = self.targets[sorted[pos]];
                left.add(y);
                right.remove(y);

                let current = self.features[sorted[pos]][feature_idx];
                let next = self.features[sorted[pos + 1]][feature_idx];
                if current == next {
                    continue;
                }
                let n_left = pos + 1;
                if n_left < min_leaf || sorted.len() - n_left < min_leaf {
                    continue;
                }

                let gain = parent_impurity
                    - left.weighted_impurity(criterion)
                    - right.weighted_impurity(criterion);

                if best.as_ref().map_or(true, |b| gain > b.gain) {
                    let mut threshold = current + (next - current) / 2.0;
                    if threshold >= next {
                        threshold = current;
                    }
                    best = Some(SplitCandidate {
                        feature_idx,
                        threshold,
                        gain,
                    });
                }
            }
        }

        best
    }

    /// Split samples based on threshold
    fn split_samples(
        &self,
        indices: &[usize],
        feature_idx: usize,
        threshold: f64,
    ) -> (Vec<usize>, Vec<usize>) {
        indices
            .iter()
            .copied()
            .partition(|&idx| self.features[idx][feature_idx] <= threshold)
    }
}
