mod container;
mod directory;
pub(crate) mod document;

pub use container::ContainerPageProvider;
pub use directory::DirectoryPageProvider;
pub use document::DocumentPageProvider;
