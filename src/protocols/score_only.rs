use crate::config::SearchParams;

/// Rescore the supplied ligand pose in place; no search.
pub fn score_args(params: &SearchParams) -> Vec<String> {
    vec![
        "--score_only".to_string(),
        "--cnn_scoring".to_string(),
        params.cnn_scoring.as_str().to_string(),
    ]
}
