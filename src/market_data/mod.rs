pub mod aggregator;
pub mod lp_stream;
pub mod market_view;
pub mod tick_store;

// Re-export the types the rest of the engine touches constantly.
pub use aggregator::{quote_channel, Aggregator};
pub use market_view::MarketView;
pub use tick_store::{Bar, TickStore};
