//! 数据模型模块
//! 用户与认证令牌模型

pub mod auth;
pub mod user;
