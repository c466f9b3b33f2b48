//! CLI command implementations.
//!
//! | Module    | Commands handled      |
//! |-----------|-----------------------|
//! | `run`     | `Run`, `Resume`       |
//! | `phase`   | `Phases`, `Status`    |
//! | `recover` | `Recover`             |
//! | `config`  | `Config`              |

pub mod config;
pub mod phase;
pub mod recover;
pub mod run;

pub use config::cmd_config;
pub use phase::{cmd_phases, cmd_status};
pub use recover::cmd_recover;
pub use run::{cmd_resume, cmd_run};
