//! Feed retrieval and parsing.
//!
//! - `parser` reduces RSS/Atom documents (via `feed-rs`) to pipeline entries
//!   and extracts the WebSub `hub`/`self` links
//! - `fetcher` performs the time- and size-bounded HTTP fetch

mod fetcher;
mod parser;

pub use fetcher::{fetch_feed, FetchError, MAX_FEED_SIZE};
pub use parser::{fingerprint, parse_feed, scoped_fingerprint, ParsedEntry, ParsedFeed};
