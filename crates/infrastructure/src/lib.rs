pub mod database;
pub mod docker_sandbox;
pub mod in_memory_queue;
pub mod memory_retry_store;
pub mod rabbitmq;
pub mod redis_retry_store;

pub use database::memory_task_repository::MemoryTaskRepository;
pub use database::postgres_task_repository::PostgresTaskRepository;
pub use docker_sandbox::DockerSandbox;
pub use in_memory_queue::InMemoryMessageQueue;
pub use memory_retry_store::MemoryRetryStore;
pub use rabbitmq::RabbitMqMessageQueue;
pub use redis_retry_store::RedisRetryStore;
