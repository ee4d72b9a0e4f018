pub mod api;
pub mod engine;
pub mod models;
pub mod sweeper;

pub use engine::{subscribe_payment_confirmations, CommitOutcome, OnboardingEngine};
pub use models::{OnboardingSession, SessionView, Stage};
pub use sweeper::{spawn as spawn_session_sweeper, sweep as sweep_sessions};
