//! Prompt templates for every generation call the engine makes.

use crate::manifest::FileManifestEntry;
use crate::phase::Phase;

pub const PLANNER_SYSTEM_PROMPT: &str = r#"You are a build planner. Given project contracts and one phase of the build plan, list every file the phase must create, modify or delete.

Respond with a single JSON object and nothing else:
{
  "questions": [],
  "files": [
    {
      "path": "app/main.py",
      "action": "create",
      "purpose": "FastAPI application factory and router registration",
      "depends_on": ["app/core/config.py"],
      "context_files": ["requirements.txt"],
      "estimated_lines": 80
    }
  ]
}

Rules:
- Paths are relative to the repository root. Never use absolute paths or "..".
- "action" is one of create, modify, delete.
- "depends_on" lists files in this manifest that must be written first.
- "context_files" lists existing files worth reading while writing this one.
- Declare every third-party dependency in the project's dependency manifest.
- Only ask "questions" when the contracts genuinely leave a decision open. Otherwise leave it empty."#;

pub const BUILDER_SYSTEM_PROMPT: &str = r#"You write exactly one source file of a larger project, following the contracts you are given.

Output the complete file inside one block and nothing else: