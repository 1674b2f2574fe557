pub mod common;
pub mod compound;
pub mod document;
pub mod entity;
pub mod history;
pub mod legacy;
pub mod query;
pub mod security;
