<full file content>
=== END FILE ===

Never elide code with comments such as "rest unchanged". Never leave TODOs or placeholder bodies."#;

pub const AUDITOR_SYSTEM_PROMPT: &str = r#"You review one generated file for structural problems only: missing symbols or imports, references to things that do not exist, dead code, and mismatch with the file's stated purpose. Ignore style.

Reply with a first line of either "VERDICT: PASS" or "VERDICT: FAIL", followed by a short list of concrete findings when failing."#;

pub const FIXER_SYSTEM_PROMPT: &str = r#"You repair one file. Make the smallest change that resolves every finding and keep everything else exactly as it is.

Output the complete repaired file inside one block and nothing else: