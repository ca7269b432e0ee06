pub mod folder_handlers;
pub mod health_handlers;
pub mod object_handlers;
pub mod progress_handlers;
