#![doc = include_str!("../README.md")]

mod cursor;
mod error;
mod handle;
mod mutex;
mod run;
mod state;
mod token;
mod worker;


pub use crate::error::*;
pub use crate::handle::*;
pub use crate::run::*;
pub use crate::token::*;
