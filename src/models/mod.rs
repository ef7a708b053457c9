//! Data models for ODL circulation

pub mod circulation;
pub mod collection;
pub mod delivery;
pub mod hold;
pub mod license;
pub mod loan;
pub mod status_document;

// Re-export commonly used types
pub use circulation::{PatronActivity, PoolAvailability};
pub use collection::{CollectionSettings, LendingPeriods};
pub use delivery::{DeliveryMechanism, DrmScheme, Fulfillment, FulfillmentStrategy};
pub use hold::{Hold, HoldInfo};
pub use license::{License, LicensePool, PoolAccess, PoolAggregates};
pub use loan::{Loan, LoanInfo};
pub use status_document::{LoanStatus, StatusDocument, StatusLink};
