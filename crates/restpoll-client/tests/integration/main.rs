mod common;
mod extractor_tests;
