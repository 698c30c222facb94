pub mod toc;
pub mod toc_cache;
pub mod toc_container;
pub mod toc_fetcher;
pub mod toc_types;
