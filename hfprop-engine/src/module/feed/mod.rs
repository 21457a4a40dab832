///! External propagation feeds
///!
///! Band conditions (hamqsl/DXView style) and solar weather (NOAA SWPC).
///! Each refresh runs fetch -> parse -> apply; a failed stage leaves the
///! propagation state untouched.

pub mod types;
pub mod parser;
pub mod fetcher;
pub mod updater;

pub use fetcher::{FeedFetcher, HttpFetcher};
pub use types::{BandCondition, BandConditionsReport, SolarWeatherReport, TimeOfDay};
pub use updater::{FeedUpdater, FeedUrls};
