//! Console protocol: localization scripts, page markup, telemetry stream and
//! the HTTP session that fetches them.

pub mod client;
pub mod language;
pub mod page;
pub mod stream;

pub use client::{build_languages, DeviceSession};
#[cfg(feature = "http")]
pub use client::HmiClient;
pub use language::LocalizationTable;
pub use page::{
    EntryDefinition, ExtractionStrategy, FlatScanStrategy, InputKind, PageModel, PageParser,
    StructuredStrategy,
};
pub use stream::{decode_ids, decode_values, ValueSample};
