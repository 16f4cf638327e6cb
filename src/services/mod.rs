pub mod conversation_service;
pub mod dispatch;
pub mod enrichment;
pub mod gateway;
pub mod health_service;
pub mod message_service;
pub mod rate_limit_service;
pub mod sync_service;
