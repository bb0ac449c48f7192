//! Сервисный слой: вся бизнес-логика поверх БД.

pub mod admin_service;
pub mod assignment_service;
pub mod group_service;
pub mod health_service;
pub mod install_service;
pub mod node_service;
pub mod token_service;
pub mod validation;
