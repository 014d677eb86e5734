use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::matrix::SimilarityMatrix;

/// Cutoff observed in the deployed client. It is almost certainly lower than
/// intended (nearly any overlap links two models), so it is only a default:
/// callers pass the threshold explicitly and the CLI/env can override it.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupingConfig {
    pub threshold: f64,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

impl GroupingConfig {
    pub fn new(threshold: f64) -> anyhow::Result<Self> {
        if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
            anyhow::bail!("similarity threshold must be within [0, 1], got {threshold}");
        }
        Ok(Self { threshold })
    }
}

/// Three-tier partition of one turn's models by response similarity.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarityGroups {
    pub request_id: String,
    pub main_group: Vec<String>,
    pub secondary_groups: Vec<Vec<String>>,
    pub outliers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupTier {
    Main,
    /// Zero-based index into `secondary_groups`.
    Secondary(usize),
    Outlier,
    Ungrouped,
}

impl GroupTier {
    pub fn label(self) -> String {
        match self {
            GroupTier::Main => "main".to_string(),
            GroupTier::Secondary(idx) => format!("secondary-{}", idx + 1),
            GroupTier::Outlier => "outlier".to_string(),
            GroupTier::Ungrouped => "ungrouped".to_string(),
        }
    }
}

impl SimilarityGroups {
    pub fn tier_of(&self, model_id: &str) -> GroupTier {
        if self.main_group.iter().any(|id| id == model_id) {
            return GroupTier::Main;
        }
        if let Some(idx) = self
            .secondary_groups
            .iter()
            .position(|group| group.iter().any(|id| id == model_id))
        {
            return GroupTier::Secondary(idx);
        }
        if self.outliers.iter().any(|id| id == model_id) {
            return GroupTier::Outlier;
        }
        GroupTier::Ungrouped
    }

    pub fn model_ids(&self) -> impl Iterator<Item = &String> {
        self.main_group
            .iter()
            .chain(self.secondary_groups.iter().flatten())
            .chain(self.outliers.iter())
    }
}

/// Partitions the matrix's models into connected components, linking two
/// models when either direction scores at least `threshold`.
///
/// The largest component is the main group (ties go to the component holding
/// the earliest-seen id). Other components of two or more models become
/// secondary groups, largest first. Singletons are outliers. With fewer than
/// two ids every id lands in the main group.
pub fn compute_groups(matrix: &SimilarityMatrix, threshold: f64) -> SimilarityGroups {
    let ids = matrix.model_ids();
    let mut groups = SimilarityGroups {
        request_id: matrix.request_id.clone(),
        ..SimilarityGroups::default()
    };
    if ids.len() < 2 {
        groups.main_group = ids;
        return groups;
    }

    let n = ids.len();
    let mut adjacency = vec![Vec::new(); n];
    for i in 0..n {
        for j in (i + 1)..n {
            let score = matrix
                .score(&ids[i], &ids[j])
                .max(matrix.score(&ids[j], &ids[i]));
            if score >= threshold {
                adjacency[i].push(j);
                adjacency[j].push(i);
            }
        }
    }

    // Scanning seeds in id order yields components ordered by their earliest id.
    let mut visited = vec![false; n];
    let mut components: Vec<Vec<usize>> = Vec::new();
    for seed in 0..n {
        if visited[seed] {
            continue;
        }
        visited[seed] = true;
        let mut component = vec![seed];
        let mut queue = VecDeque::from([seed]);
        while let Some(node) = queue.pop_front() {
            for &next in &adjacency[node] {
                if !visited[next] {
                    visited[next] = true;
                    component.push(next);
                    queue.push_back(next);
                }
            }
        }
        component.sort_unstable();
        components.push(component);
    }

    let names = |component: &[usize]| -> Vec<String> {
        component.iter().map(|&idx| ids[idx].clone()).collect()
    };

    let mut main_idx: Option<usize> = None;
    for (idx, component) in components.iter().enumerate() {
        if component.len() < 2 {
            continue;
        }
        let larger = main_idx
            .map(|current| component.len() > components[current].len())
            .unwrap_or(true);
        if larger {
            main_idx = Some(idx);
        }
    }

    let mut secondary: Vec<&Vec<usize>> = Vec::new();
    let mut outliers: Vec<usize> = Vec::new();
    for (idx, component) in components.iter().enumerate() {
        if Some(idx) == main_idx {
            groups.main_group = names(component.as_slice());
        } else if component.len() >= 2 {
            secondary.push(component);
        } else {
            outliers.extend(component.iter().copied());
        }
    }
    secondary.sort_by(|a, b| b.len().cmp(&a.len()));
    groups.secondary_groups = secondary.into_iter().map(|c| names(c.as_slice())).collect();
    // Outliers come from components in seed order; sorting the indices
    // restores first-seen id order.
    outliers.sort_unstable();
    groups.outliers = names(outliers.as_slice());
    groups
}

/// Decodes the group shapes older backends send without a usable matrix:
/// either `similarGroups` (list of clusters, first is main) or
/// `mainGroup`/`outliers`.
pub fn decode_groups(request_id: &str, result: &Value) -> Option<SimilarityGroups> {
    let mut groups = SimilarityGroups {
        request_id: request_id.to_string(),
        ..SimilarityGroups::default()
    };

    if let Some(clusters) = result
        .get("similarGroups")
        .and_then(Value::as_array)
        .filter(|rows| !rows.is_empty())
    {
        // A model listed in several clusters stays in the first one.
        let mut placed: Vec<String> = Vec::new();
        let mut clusters = clusters.iter().map(|row| {
            let cluster: Vec<String> = string_list(row)
                .into_iter()
                .filter(|id| !placed.contains(id))
                .collect();
            placed.extend(cluster.iter().cloned());
            cluster
        });
        groups.main_group = clusters.next().unwrap_or_default();
        for cluster in clusters {
            match cluster.len() {
                0 => {}
                1 => groups.outliers.extend(cluster),
                _ => groups.secondary_groups.push(cluster),
            }
        }
        groups.secondary_groups.sort_by(|a, b| b.len().cmp(&a.len()));
        return Some(groups);
    }

    let main = result.get("mainGroup").filter(|value| value.is_array())?;
    groups.main_group = string_list(main);
    groups.outliers = result.get("outliers").map(string_list).unwrap_or_default();
    groups
        .outliers
        .retain(|id| !groups.main_group.contains(id));
    Some(groups)
}

fn string_list(value: &Value) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in value.as_array().map(Vec::as_slice).unwrap_or_default() {
        if let Some(text) = item.as_str() {
            if !out.iter().any(|existing| existing == text) {
                out.push(text.to_string());
            }
        }
    }
    out
}
