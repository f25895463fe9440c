pub mod mock;
pub mod openai;
pub mod reliable;

pub use mock::{MockProvider, MockResponse};
pub use openai::{OpenAiCompatConfig, OpenAiCompatProvider};
pub use reliable::{ReliableConfig, ReliableProvider};
