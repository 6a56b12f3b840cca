// Edge-case tests for the skip segment store
// Run with: cargo test --lib database::tests

#[cfg(test)]
mod skip_segment_tests {
    use crate::database::{Database, DetectionMethod, SegmentType, SkipSegment};
    use tempfile::TempDir;

    fn setup_test_db() -> (Database, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(&db_path).unwrap();
        (db, temp_dir)
    }

    fn segment(episode: i64, kind: SegmentType, start: f64, end: f64) -> SkipSegment {
        SkipSegment {
            series_id: "naruto".into(),
            source_id: "voiranime".into(),
            episode_number: episode,
            segment_type: kind,
            start_sec: start,
            end_sec: end,
            confidence: 0.8,
            detection_method: DetectionMethod::Heuristic,
            created_at: None,
        }
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    #[test]
    fn test_missing_episode_returns_none() {
        let (db, _temp) = setup_test_db();
        assert!(db.get_skip_segments("naruto", "voiranime", 1).unwrap().is_none());
    }

    #[test]
    fn test_pair_round_trip() {
        let (db, _temp) = setup_test_db();
        db.save_skip_segment(&segment(3, SegmentType::Opening, 12.5, 102.5)).unwrap();
        db.save_skip_segment(&segment(3, SegmentType::Ending, 1290.0, 1380.0)).unwrap();

        let pair = db.get_skip_segments("naruto", "voiranime", 3).unwrap().unwrap();
        let opening = pair.opening.unwrap();
        let ending = pair.ending.unwrap();
        assert_eq!(opening.start_sec, 12.5);
        assert_eq!(opening.end_sec, 102.5);
        assert_eq!(ending.segment_type, SegmentType::Ending);
        assert!(opening.created_at.is_some());
    }

    #[test]
    fn test_only_opening_stored() {
        let (db, _temp) = setup_test_db();
        db.save_skip_segment(&segment(1, SegmentType::Opening, 0.0, 90.0)).unwrap();

        let pair = db.get_skip_segments("naruto", "voiranime", 1).unwrap().unwrap();
        assert!(pair.opening.is_some());
        assert!(pair.ending.is_none());
    }

    #[test]
    fn test_single_type_lookup() {
        let (db, _temp) = setup_test_db();
        db.save_skip_segment(&segment(1, SegmentType::Ending, 1300.0, 1390.0)).unwrap();

        assert!(db
            .get_skip_segment("naruto", "voiranime", 1, SegmentType::Opening)
            .unwrap()
            .is_none());
        let ending = db
            .get_skip_segment("naruto", "voiranime", 1, SegmentType::Ending)
            .unwrap()
            .unwrap();
        assert_eq!(ending.start_sec, 1300.0);
    }

    #[test]
    fn test_keys_are_scoped_by_source_and_series() {
        let (db, _temp) = setup_test_db();
        db.save_skip_segment(&segment(1, SegmentType::Opening, 0.0, 90.0)).unwrap();

        assert!(db.get_skip_segments("naruto", "voirdrama", 1).unwrap().is_none());
        assert!(db.get_skip_segments("bleach", "voiranime", 1).unwrap().is_none());
        assert!(db.get_skip_segments("naruto", "voiranime", 2).unwrap().is_none());
    }

    // =========================================================================
    // Upsert semantics
    // =========================================================================

    #[test]
    fn test_second_write_replaces_first() {
        let (db, _temp) = setup_test_db();
        db.save_skip_segment(&segment(5, SegmentType::Opening, 10.0, 100.0)).unwrap();

        let mut corrected = segment(5, SegmentType::Opening, 14.0, 104.0);
        corrected.confidence = 1.0;
        corrected.detection_method = DetectionMethod::Manual;
        db.save_skip_segment(&corrected).unwrap();

        let stats = db.count_by_method().unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.manual, 1);

        let stored = db
            .get_skip_segment("naruto", "voiranime", 5, SegmentType::Opening)
            .unwrap()
            .unwrap();
        assert_eq!(stored.start_sec, 14.0);
        assert_eq!(stored.end_sec, 104.0);
        assert_eq!(stored.detection_method, DetectionMethod::Manual);
    }

    #[test]
    fn test_inverted_segment_rejected() {
        let (db, _temp) = setup_test_db();
        let result = db.save_skip_segment(&segment(1, SegmentType::Opening, 90.0, 90.0));
        assert!(result.is_err());
        assert!(db.get_skip_segments("naruto", "voiranime", 1).unwrap().is_none());
    }

    #[test]
    fn test_pair_saved_together() {
        let (db, _temp) = setup_test_db();
        db.save_skip_segments(&[
            segment(1, SegmentType::Opening, 0.0, 90.0),
            segment(1, SegmentType::Ending, 1300.0, 1390.0),
        ])
        .unwrap();
        let stored = db.get_skip_segments("naruto", "voiranime", 1).unwrap().unwrap();
        assert!(stored.opening.is_some());
        assert!(stored.ending.is_some());
    }

    #[test]
    fn test_invalid_ending_discards_whole_pair() {
        let (db, _temp) = setup_test_db();
        db.save_skip_segment(&segment(1, SegmentType::Opening, 0.0, 90.0)).unwrap();

        let result = db.save_skip_segments(&[
            segment(1, SegmentType::Opening, 10.0, 100.0),
            segment(1, SegmentType::Ending, 1390.0, 1300.0),
        ]);
        assert!(result.is_err());

        let stored = db.get_skip_segments("naruto", "voiranime", 1).unwrap().unwrap();
        assert_eq!(stored.opening.unwrap().start_sec, 0.0);
        assert!(stored.ending.is_none());
    }

    #[test]
    fn test_confidence_is_clamped() {
        let (db, _temp) = setup_test_db();
        let mut seg = segment(1, SegmentType::Opening, 0.0, 90.0);
        seg.confidence = 1.7;
        db.save_skip_segment(&seg).unwrap();

        let stored = db
            .get_skip_segment("naruto", "voiranime", 1, SegmentType::Opening)
            .unwrap()
            .unwrap();
        assert_eq!(stored.confidence, 1.0);
    }

    // =========================================================================
    // Deletion and listing
    // =========================================================================

    #[test]
    fn test_delete_removes_both_types() {
        let (db, _temp) = setup_test_db();
        db.save_skip_segment(&segment(2, SegmentType::Opening, 0.0, 90.0)).unwrap();
        db.save_skip_segment(&segment(2, SegmentType::Ending, 1300.0, 1390.0)).unwrap();
        db.save_skip_segment(&segment(3, SegmentType::Opening, 0.0, 90.0)).unwrap();

        let removed = db.delete_skip_segments("naruto", "voiranime", 2).unwrap();
        assert_eq!(removed, 2);
        assert!(db.get_skip_segments("naruto", "voiranime", 2).unwrap().is_none());
        assert!(db.get_skip_segments("naruto", "voiranime", 3).unwrap().is_some());
    }

    #[test]
    fn test_delete_missing_episode_is_noop() {
        let (db, _temp) = setup_test_db();
        assert_eq!(db.delete_skip_segments("naruto", "voiranime", 42).unwrap(), 0);
    }

    #[test]
    fn test_analyzed_episode_numbers() {
        let (db, _temp) = setup_test_db();
        db.save_skip_segment(&segment(1, SegmentType::Opening, 0.0, 90.0)).unwrap();
        db.save_skip_segment(&segment(1, SegmentType::Ending, 1300.0, 1390.0)).unwrap();
        db.save_skip_segment(&segment(4, SegmentType::Ending, 1300.0, 1390.0)).unwrap();

        let numbers = db.analyzed_episode_numbers("naruto", "voiranime").unwrap();
        assert_eq!(numbers.into_iter().collect::<Vec<_>>(), vec![1, 4]);
    }

    #[test]
    fn test_in_memory_store() {
        let db = Database::open_in_memory().unwrap();
        db.save_skip_segment(&segment(1, SegmentType::Opening, 0.0, 90.0)).unwrap();
        assert_eq!(db.count_by_method().unwrap().heuristic, 1);
    }
}
