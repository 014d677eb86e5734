mod grouping;
mod matrix;

pub use grouping::{
    compute_groups, decode_groups, GroupTier, GroupingConfig, SimilarityGroups,
    DEFAULT_SIMILARITY_THRESHOLD,
};
pub use matrix::SimilarityMatrix;
