pub mod fakeip;
pub mod interceptor;

pub use fakeip::{FakeIpEntry, FakeIpPool};
