pub mod base;
pub mod clients;
pub mod common;
pub mod config;
pub mod connection;
pub mod error;
pub mod observer;
pub mod reactor;
pub mod servers;

pub use config::ReactorConfig;
pub use connection::{ConnEvent, Connection, SendTag, Status, Transport};
pub use error::{
    AuthError, ConnectionError, DataError, Error, GeneratorError, ParserError, Result,
};
pub use observer::{HandlerId, Observable, Signal};
pub use reactor::{Agent, Interest, Owner, Reactor, TimerId, Token};
