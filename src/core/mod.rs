pub mod checkpoint;
pub mod duplicate;
pub mod identify;
pub mod image;
pub mod layout;
pub mod models;
pub mod pipeline;
pub mod report;
pub mod verify;
