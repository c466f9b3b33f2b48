  === END ===
=== FILE ===
=== END FILE ===
";
        assert_eq!(parse_blocks(text), vec![("notes.md".to_string(), "  === END ===\n=== FILE ===\n".to_string())]);
    }

    #[test]
    fn test_plain_text_passes_through() {
        let mut parser = BlockParser::new();
        let events = parser.feed("hello\nworld\n");
        assert_eq!(
            events,
            vec![
                BlockEvent::TextChunk("hello\n".into()),
                BlockEvent::TextChunk("world\n".into())
            ]
        );
    }
}
