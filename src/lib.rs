pub mod api;
pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod fill;
pub mod hub;
pub mod ledger;
pub mod logging;
pub mod market_data;
pub mod matching;
pub mod messages;
pub mod offers;
pub mod orderbook;
pub mod orders;
pub mod product;
pub mod production;
pub mod rate_limit;
pub mod session;
pub mod settlement;
pub mod state;
pub mod store;
pub mod team;
pub mod utils;
