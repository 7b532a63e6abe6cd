pub mod claimmap;
pub mod client;
pub mod clientlet;
pub mod config;
pub mod scanner;
pub mod server;
pub mod servlet;
pub mod support;
pub mod transfer;
pub mod transport;
