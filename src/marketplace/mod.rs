//! Marketplace collaborators the order core depends on.
//!
//! Listings, users, notifications and fund movements sit behind traits so
//! settlement logic can be exercised without the full marketplace around it.

mod funds;
mod listings;
mod notify;
mod users;

pub use funds::{FundsGateway, LoggingFundsGateway};
pub use listings::{ListingProvider, ListingStatus, ListingSummary, PgListingProvider};
pub use notify::{NotificationSink, PgNotificationSink};
pub use users::{PgUserProvider, UserProvider, UserSummary};
