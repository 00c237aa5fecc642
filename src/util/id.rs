use uuid::Uuid;

/// 每个请求一个 id，挂在 tracing span 上便于串联日志。
pub fn request_id() -> String {
    format!("req-{}", Uuid::new_v4().simple())
}
