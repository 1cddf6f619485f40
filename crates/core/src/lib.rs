pub mod clock;
pub mod config;
pub mod error;
pub mod templates;
pub mod types;

pub use clock::{Clock, MockClock, SystemClock};
pub use config::{AppConfig, DripConfig};
pub use error::{CampaignError, CampaignResult, TransportError};
pub use templates::{escape_html, TemplateEngine, TemplateRenderer};
pub use types::{Campaign, FieldValue, FilterRule, Lookup, RuleMethod, SentRecord, User};
