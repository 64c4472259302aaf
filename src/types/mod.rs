pub mod claude;
pub mod streaming;
pub mod web;
