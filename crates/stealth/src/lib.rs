pub mod access;
pub mod browser;
pub mod client;
pub mod crawler;
pub mod detection;

pub use access::AccessController;
pub use browser::{BrowserManager, PageFetch, PageFetcher};
pub use client::{FetchResponse, HttpClient};
pub use crawler::{HttpCrawler, StealthCrawler};
pub use detection::DetectionKind;
