//! Core library for spotify-tidal-sync: one-way playlist reconciliation
//! between Spotify and TIDAL plus the credential lifecycle behind it.
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod retry;
pub mod auth;
pub mod api;
pub mod matcher;
pub mod reconcile;
pub mod sync;
