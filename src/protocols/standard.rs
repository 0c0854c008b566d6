use crate::config::SearchParams;

/// Search flags for a full docking run.
pub fn search_args(params: &SearchParams) -> Vec<String> {
    vec![
        "--exhaustiveness".to_string(),
        params.exhaustiveness.to_string(),
        "--num_modes".to_string(),
        params.num_modes.to_string(),
        "--seed".to_string(),
        params.seed.to_string(),
        "--cnn_scoring".to_string(),
        params.cnn_scoring.as_str().to_string(),
        "--cnn_rotation".to_string(),
        params.cnn_rotation.to_string(),
        "--min_rmsd_filter".to_string(),
        params.min_rmsd_filter.to_string(),
        "--pose_sort_order".to_string(),
        params.pose_sort_order.as_str().to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CnnScoring, PoseSortOrder};

    #[test]
    fn flags_use_gnina_spelling() {
        let params = SearchParams {
            cnn_scoring: CnnScoring::All,
            pose_sort_order: PoseSortOrder::CNNaffinity,
            ..SearchParams::default()
        };
        let args = search_args(&params);
        let joined = args.join(" ");
        assert_eq!(
            joined,
            "--exhaustiveness 32 --num_modes 20 --seed 42 --cnn_scoring all \
             --cnn_rotation 0 --min_rmsd_filter 1 --pose_sort_order CNNaffinity"
        );
    }
}
