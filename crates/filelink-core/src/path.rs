//! 远端文件命名空间的路径工具
//!
//! 纯字符串操作，分隔符固定为 `/`，不访问本地文件系统。

pub const SEPARATOR: char = '/';

/// 最后一个 `/` 之后的部分；没有分隔符时返回整个字符串
pub fn filename_from_path(path: &str) -> &str {
    match path.rfind(SEPARATOR) {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// 截至（含）最后一个 `/` 的部分；没有分隔符时原样返回
pub fn path_removing_filename(path: &str) -> &str {
    match path.rfind(SEPARATOR) {
        Some(idx) => &path[..=idx],
        None => path,
    }
}

/// 上一级目录：先去掉一个结尾分隔符，再去掉文件名部分
pub fn up_path(path: &str) -> &str {
    let trimmed = path.strip_suffix(SEPARATOR).unwrap_or(path);
    path_removing_filename(trimmed)
}

pub fn is_root_directory(path: &str) -> bool {
    path == "/"
}

/// 规范化为绝对路径并合并重复的分隔符
///
/// 结尾的 `/` 会被保留，因为外设用它区分目录。
pub fn normalize(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    out.push(SEPARATOR);
    for segment in path.split(SEPARATOR).filter(|s| !s.is_empty()) {
        out.push_str(segment);
        out.push(SEPARATOR);
    }
    if !path.ends_with(SEPARATOR) && out.len() > 1 {
        out.pop();
    }
    out
}

pub fn join(dir: &str, name: &str) -> String {
    let name = name.trim_start_matches(SEPARATOR);
    if dir.ends_with(SEPARATOR) {
        format!("{dir}{name}")
    } else {
        format!("{dir}{SEPARATOR}{name}")
    }
}
