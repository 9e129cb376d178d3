//! Domain layer - Pure business logic.

// Probe parsing and encode argument construction
pub mod av;

// Job and batch records with their state machines
pub mod jobs;

// Progress metrics and message rendering
pub mod report;

// Encoder diagnostic line parsing
pub mod telemetry;
