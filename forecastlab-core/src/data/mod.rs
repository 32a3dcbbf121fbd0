//! Market data collection: source trait, Polygon REST source, CSV import, synthetic data.

pub mod circuit_breaker;
pub mod csv_source;
pub mod polygon;
pub mod provider;
pub mod synthetic;

pub use circuit_breaker::CircuitBreaker;
pub use csv_source::CsvSource;
pub use polygon::PolygonSource;
pub use provider::{
    dataset_hash, normalize_order, DataError, FetchResult, MarketDataSource, SourceKind,
};
pub use synthetic::SyntheticSource;
