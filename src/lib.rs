//! 考试系统认证服务库
//! 密码哈希、令牌签发与轮换、请求鉴权

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod repository;
pub mod routes;
pub mod services;
pub mod telemetry;
