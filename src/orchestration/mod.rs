pub mod page_analyzer;

pub use page_analyzer::PageAnalyzer;
