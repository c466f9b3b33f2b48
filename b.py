print('b')
=== END FILE ===
";
        let blocks = parse_blocks(text);
        assert_eq!(
            blocks,
            vec![
                ("a.py".to_string(), "print('a')\n".to_string()),
                ("b.py".to_string(), "print('b')\n".to_string()),
            ]
        );
    }

    #[test]
    fn test_block_open_at_end_of_input_is_dropped() {
        let mut parser = BlockParser::new();
        let mut events = parser.feed("=== FILE: a.py ===\nx = 1\n");
        events.extend(parser.finish());
        assert!(events.contains(&BlockEvent::FileDropped {
            path: "a.py".into()
        }));
        assert!(!events
            .iter()
            .any(|e| matches!(e, BlockEvent::FileCompleted { .. })));
    }

    #[test]
    fn test_chunks_split_mid_line() {
        let mut parser = BlockParser::new();
        let mut events = Vec::new();
        for chunk in ["=== FI", "LE: x.py ===\nde", "f f():\n    pass\n=== END", " FILE ==="] {
            events.extend(parser.feed(chunk));
        }
        events.extend(parser.finish());
        assert!(events.contains(&BlockEvent::FileCompleted {
            path: "x.py".into(),
            content: "def f():\n    pass\n".into(),
        }));
    }

    #[test]
    fn test_markers_inside_content_are_kept() {
        let text = "\
Here is the file: