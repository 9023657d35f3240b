mod file;

pub use file::FileCatalogBackend;
