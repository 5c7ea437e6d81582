#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod selector;
pub mod template;

pub use self::{
    selector::{matches, NamespaceMatcher},
    template::{Context, Engine},
};
