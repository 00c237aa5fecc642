/// 粗略估算 prompt 的 token 数：约 4 个字符一个 token，非空 prompt 至少为 1。
pub fn estimate_tokens(prompt: &str) -> u64 {
    let chars = prompt.chars().count() as u64;
    chars.div_ceil(4)
}
