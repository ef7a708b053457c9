//! Business logic services

pub mod circulation;
pub mod hold_queue;
pub mod ledger;
pub mod notifier;
pub mod passphrase;
pub mod providers;
pub mod reconcile;
pub mod status_document;
pub mod uri_template;

pub use circulation::CirculationService;
pub use notifier::{EmailNotifier, HoldNotifier, NoopNotifier};
pub use status_document::{HttpStatusDocumentClient, StatusDocumentApi};
