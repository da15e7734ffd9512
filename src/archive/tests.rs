#[cfg(test)]
mod tests {
    use crate::archive::store::Archive;
    use serde::{Deserialize, Serialize};
    use std::path::PathBuf;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Document {
        id: String,
        body: String,
    }

    fn scratch_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        dir.path().join(name)
    }

    // ============================================================
    // ROUND-TRIP AND FILE LAYOUT
    // ============================================================

    #[test]
    fn test_insert_load_roundtrip_raw() {
        let dir = tempfile::tempdir().unwrap();
        let mut ar: Archive<u64> = Archive::open(scratch_path(&dir, "ar")).unwrap();
        ar.set_buffer_size(100).unwrap();

        let size = ar.insert_raw(42, b"hello".to_vec(), true).unwrap();
        assert_eq!(size, 5);

        let mut out = Vec::new();
        assert_eq!(ar.load_raw(&42, &mut out, true).unwrap(), 5);
        assert_eq!(out, b"hello");
    }

    #[test]
    fn test_insert_load_roundtrip_typed() {
        let dir = tempfile::tempdir().unwrap();
        let mut ar: Archive<String> = Archive::open(scratch_path(&dir, "ar")).unwrap();
        ar.set_buffer_size(1000).unwrap();

        let doc = Document {
            id: "doc-001".to_string(),
            body: "some text".to_string(),
        };
        let size = ar.insert("doc-001".to_string(), &doc, true).unwrap();
        assert!(size > 0);

        let mut back = Document {
            id: String::new(),
            body: String::new(),
        };
        assert_eq!(ar.load(&"doc-001".to_string(), &mut back, true).unwrap(), size);
        assert_eq!(back, doc);
    }

    #[test]
    fn test_file_layout_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_path(&dir, "ar");
        {
            let mut ar: Archive<u64> = Archive::open(&path).unwrap();
            ar.set_buffer_size(100).unwrap();
            ar.insert_raw(42, b"hello".to_vec(), true).unwrap();
        }

        // count + key_len + data_len + encoded key + payload
        let expected = 8 + 8 + 8 + 8 + 5;
        assert_eq!(std::fs::metadata(&path).unwrap().len(), expected);
    }

    #[test]
    fn test_write_through_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_path(&dir, "ar");
        {
            let mut ar: Archive<u64> = Archive::open(&path).unwrap();
            ar.set_buffer_size(100).unwrap();
            ar.insert_raw(0, b"1".to_vec(), false).unwrap();
            ar.insert_raw(2, b"3".to_vec(), false).unwrap();
            assert_eq!(ar.buffer_size(), 0);
        }

        let expected = 8 + 2 * (8 + 8 + 8 + 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), expected);
    }

    #[test]
    fn test_overwrite_compacts_on_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_path(&dir, "ar");
        {
            let mut ar: Archive<u64> = Archive::open(&path).unwrap();
            ar.set_buffer_size(100).unwrap();
            ar.insert_raw(0, b"1".to_vec(), true).unwrap();
            ar.insert_raw(0, b"333".to_vec(), true).unwrap();
        }

        // Exactly one surviving record for key 0.
        let expected = 8 + 8 + 8 + 8 + 3;
        assert_eq!(std::fs::metadata(&path).unwrap().len(), expected);

        let mut ar: Archive<u64> = Archive::open(&path).unwrap();
        ar.set_buffer_size(100).unwrap();
        let mut out = Vec::new();
        assert_eq!(ar.load_raw(&0, &mut out, true).unwrap(), 3);
        assert_eq!(out, b"333");
    }

    #[test]
    fn test_reopen_preserves_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_path(&dir, "ar");
        {
            let mut ar: Archive<u64> = Archive::open(&path).unwrap();
            ar.set_buffer_size(50).unwrap();
            ar.insert_raw(0, b"1".to_vec(), true).unwrap();
            ar.insert_raw(2, b"3".to_vec(), true).unwrap();

            let mut out = Vec::new();
            assert_eq!(ar.load_raw(&0, &mut out, true).unwrap(), 1);
            assert_eq!(out, b"1");
        }

        let mut ar: Archive<u64> = Archive::open(&path).unwrap();
        ar.set_buffer_size(50).unwrap();
        assert_eq!(ar.len(), 2);

        let mut out = Vec::new();
        assert_eq!(ar.load_raw(&0, &mut out, true).unwrap(), 1);
        assert_eq!(out, b"1");
        assert_eq!(ar.load_raw(&2, &mut out, true).unwrap(), 1);
        assert_eq!(out, b"3");
    }

    // ============================================================
    // BUFFER POLICY
    // ============================================================

    #[test]
    fn test_eviction_under_budget() {
        let dir = tempfile::tempdir().unwrap();
        let mut ar: Archive<u64> = Archive::open(scratch_path(&dir, "ar")).unwrap();
        ar.set_buffer_size(8).unwrap();

        ar.insert_raw(1, vec![b'a'; 5], true).unwrap();
        ar.insert_raw(2, vec![b'b'; 5], true).unwrap();

        // Key 1 was evicted to make room for key 2.
        assert_eq!(ar.buffer_size(), 5);

        let mut out = Vec::new();
        assert_eq!(ar.load_raw(&1, &mut out, true).unwrap(), 5);
        assert_eq!(out, vec![b'a'; 5]);
        assert!(ar.buffer_size() <= 8);
    }

    #[test]
    fn test_oversized_object_bypasses_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let mut ar: Archive<u64> = Archive::open(scratch_path(&dir, "ar")).unwrap();
        ar.set_buffer_size(4).unwrap();

        let size = ar.insert_raw(9, vec![b'x'; 8], true).unwrap();
        assert_eq!(size, 8);
        assert_eq!(ar.buffer_size(), 0);

        let mut out = Vec::new();
        assert_eq!(ar.load_raw(&9, &mut out, true).unwrap(), 8);
        assert_eq!(out, vec![b'x'; 8]);
        assert_eq!(ar.buffer_size(), 0);
    }

    #[test]
    fn test_zero_budget_streams_through() {
        let dir = tempfile::tempdir().unwrap();
        let mut ar: Archive<u64> = Archive::open(scratch_path(&dir, "ar")).unwrap();

        // Default budget is zero: nothing is cached, everything still works.
        ar.insert_raw(7, b"payload".to_vec(), true).unwrap();
        assert_eq!(ar.buffer_size(), 0);

        let mut out = Vec::new();
        assert_eq!(ar.load_raw(&7, &mut out, true).unwrap(), 7);
        assert_eq!(out, b"payload");
        assert_eq!(ar.buffer_size(), 0);
    }

    #[test]
    fn test_set_buffer_size_shrink_evicts() {
        let dir = tempfile::tempdir().unwrap();
        let mut ar: Archive<u64> = Archive::open(scratch_path(&dir, "ar")).unwrap();
        ar.set_buffer_size(100).unwrap();

        for i in 0..3 {
            ar.insert_raw(i, vec![b'v'; 10], true).unwrap();
        }
        assert_eq!(ar.buffer_size(), 30);

        ar.set_buffer_size(10).unwrap();
        assert!(ar.buffer_size() <= 10);

        let mut out = Vec::new();
        assert_eq!(ar.load_raw(&0, &mut out, true).unwrap(), 10);
    }

    #[test]
    fn test_flush_empties_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let mut ar: Archive<u64> = Archive::open(scratch_path(&dir, "ar")).unwrap();
        ar.set_buffer_size(100).unwrap();

        ar.insert_raw(1, b"one".to_vec(), true).unwrap();
        ar.insert_raw(2, b"two".to_vec(), true).unwrap();
        assert_eq!(ar.buffer_size(), 6);

        ar.flush().unwrap();
        assert_eq!(ar.buffer_size(), 0);
        assert_eq!(ar.len(), 2);

        let mut out = Vec::new();
        assert_eq!(ar.load_raw(&1, &mut out, true).unwrap(), 3);
        assert_eq!(out, b"one");
    }

    // ============================================================
    // REMOVE / CHANGE_KEY / CLEAR
    // ============================================================

    #[test]
    fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_path(&dir, "ar");
        {
            let mut ar: Archive<u64> = Archive::open(&path).unwrap();
            ar.set_buffer_size(100).unwrap();
            ar.insert_raw(5, b"value".to_vec(), true).unwrap();
            ar.remove(&5);

            assert!(!ar.is_available(&5));
            assert_eq!(ar.buffer_size(), 0);

            let mut out = Vec::new();
            assert_eq!(ar.load_raw(&5, &mut out, true).unwrap(), 0);
        }

        let ar: Archive<u64> = Archive::open(&path).unwrap();
        assert!(ar.is_empty());
    }

    #[test]
    fn test_change_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_path(&dir, "ar");
        {
            let mut ar: Archive<u64> = Archive::open(&path).unwrap();
            ar.set_buffer_size(100).unwrap();

            let s1 = ar.insert_raw(0, b"1".to_vec(), true).unwrap();
            ar.change_key(&0, 2);

            assert!(!ar.is_available(&0));
            assert!(ar.is_available(&2));

            let mut out = Vec::new();
            assert_eq!(ar.load_raw(&2, &mut out, true).unwrap(), s1);
            assert_eq!(out, b"1");
        }

        let mut ar: Archive<u64> = Archive::open(&path).unwrap();
        assert!(!ar.is_available(&0));
        let mut out = Vec::new();
        assert_eq!(ar.load_raw(&2, &mut out, true).unwrap(), 1);
        assert_eq!(out, b"1");
    }

    #[test]
    fn test_change_key_replaces_destination() {
        let dir = tempfile::tempdir().unwrap();
        let mut ar: Archive<u64> = Archive::open(scratch_path(&dir, "ar")).unwrap();
        ar.set_buffer_size(100).unwrap();

        ar.insert_raw(1, b"old".to_vec(), true).unwrap();
        ar.insert_raw(2, b"taken".to_vec(), true).unwrap();
        ar.change_key(&1, 2);

        assert!(!ar.is_available(&1));
        let mut out = Vec::new();
        assert_eq!(ar.load_raw(&2, &mut out, true).unwrap(), 3);
        assert_eq!(out, b"old");
        assert_eq!(ar.buffer_size(), 3);
    }

    #[test]
    fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_path(&dir, "ar");

        let mut ar: Archive<u64> = Archive::open(&path).unwrap();
        ar.set_buffer_size(100).unwrap();
        ar.insert_raw(0, b"1".to_vec(), true).unwrap();
        ar.insert_raw(2, b"3".to_vec(), true).unwrap();

        ar.clear().unwrap();
        assert!(ar.is_empty());
        assert_eq!(ar.buffer_size(), 0);

        // Only the zero-count header remains.
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8);
    }

    // ============================================================
    // LIFECYCLE
    // ============================================================

    #[test]
    fn test_temp_archive_cleanup_on_drop() {
        let path;
        {
            let mut ar: Archive<u64> = Archive::new().unwrap();
            ar.set_buffer_size(100).unwrap();
            ar.insert_raw(1, b"gone".to_vec(), true).unwrap();
            path = ar.path().to_path_buf();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_init_repoints_archive() {
        let dir = tempfile::tempdir().unwrap();
        let first = scratch_path(&dir, "first");
        let second = scratch_path(&dir, "second");

        let mut ar: Archive<u64> = Archive::open(&first).unwrap();
        ar.set_buffer_size(100).unwrap();
        ar.insert_raw(1, b"alpha".to_vec(), true).unwrap();

        ar.init(&second).unwrap();
        assert!(ar.is_empty());
        ar.insert_raw(2, b"beta".to_vec(), true).unwrap();
        drop(ar);

        // The first file was flushed before the switch.
        let mut ar: Archive<u64> = Archive::open(&first).unwrap();
        let mut out = Vec::new();
        assert_eq!(ar.load_raw(&1, &mut out, true).unwrap(), 5);
        assert_eq!(out, b"alpha");

        let mut ar: Archive<u64> = Archive::open(&second).unwrap();
        assert_eq!(ar.load_raw(&2, &mut out, true).unwrap(), 4);
        assert_eq!(out, b"beta");
    }

    #[test]
    fn test_load_missing_returns_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut ar: Archive<u64> = Archive::open(scratch_path(&dir, "ar")).unwrap();

        let mut out = b"untouched".to_vec();
        assert_eq!(ar.load_raw(&404, &mut out, true).unwrap(), 0);
        assert_eq!(out, b"untouched");
    }

    #[test]
    fn test_available_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut ar: Archive<u64> = Archive::open(scratch_path(&dir, "ar")).unwrap();
        ar.set_buffer_size(100).unwrap();

        for i in [3u64, 1, 2] {
            ar.insert_raw(i, b"v".to_vec(), true).unwrap();
        }

        let keys: Vec<u64> = ar.available_keys().copied().collect();
        assert_eq!(keys, vec![1, 2, 3]);
    }

    #[test]
    fn test_last_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut ar: Archive<String> = Archive::open(scratch_path(&dir, "ar")).unwrap();
        ar.set_buffer_size(100).unwrap();

        ar.insert_raw("k".to_string(), b"v1".to_vec(), true).unwrap();
        ar.insert_raw("k".to_string(), b"v2".to_vec(), true).unwrap();

        let mut out = Vec::new();
        assert_eq!(ar.load_raw(&"k".to_string(), &mut out, true).unwrap(), 2);
        assert_eq!(out, b"v2");
        assert_eq!(ar.len(), 1);
    }
}
