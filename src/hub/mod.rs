pub mod batch;
pub mod connection_string;
pub mod producer;
pub mod publisher;
pub mod serializer;

pub use batch::BatchPublisher;
pub use connection_string::EventHubConnection;
pub use producer::KafkaPublisher;
pub use publisher::{Message, Publisher};
pub use serializer::JsonSerializer;
