pub mod search_path;
