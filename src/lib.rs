// Library root
// ------------
// The binary (`main.rs`) only sets up logging and hands the command line to
// `app::run`.
//
// Module responsibilities:
// - `credentials`: the persisted session and its JSON file.
// - `auth`: device-code login and token refresh.
// - `workflow`: listing workflows and validating the user's choice.
// - `pipeline`: upload, status polling and result download for a batch.
// - `api`: the reqwest client behind the auth and processing traits.
// - `files`: finding images and deciding where results go.
// - `settings`: environment configuration.
// - `ui`: prompts, progress and summary output.
// - `app`: wires everything together for one run.
pub mod api;
pub mod app;
pub mod auth;
pub mod credentials;
pub mod error;
pub mod files;
pub mod pipeline;
pub mod settings;
pub mod ui;
pub mod workflow;
