use crate::r#const::{external_fetch, profile};
use sha2::{Digest, Sha256};
use std::env;
use std::io;
use std::path::{Path, PathBuf};

// 返回配置目录，优先使用 PROFILE_PLACE 环境变量
pub fn profile_dir() -> PathBuf {
    match env::var(profile::ENV_PROFILE_PLACE) {
        Ok(place) if !place.is_empty() => PathBuf::from(place),
        _ => default_profile_dir(),
    }
}

// 平台默认配置目录 - Windows使用当前工作目录
#[cfg(target_os = "windows")]
fn default_profile_dir() -> PathBuf {
    env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

// 平台默认配置目录 - macOS使用应用支持目录
#[cfg(target_os = "macos")]
fn default_profile_dir() -> PathBuf {
    let home = env::var("HOME").unwrap_or_default();
    PathBuf::from(home)
        .join("Library/Application Support")
        .join(profile::APP_ID)
}

// 平台默认配置目录 - 其他平台使用可执行文件所在目录
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn default_profile_dir() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

// 创建目录并收紧权限
pub fn ensure_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(profile::DIR_MODE)
            .create(path)
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(path)
    }
}

// 返回配置文件的完整路径，按需创建配置目录
pub fn config_path() -> io::Result<PathBuf> {
    let dir = profile_dir();
    ensure_dir(&dir)?;
    Ok(dir.join(profile::CONFIG_FILE))
}

// 返回外部规则磁盘缓存目录，按需创建
pub fn cache_dir() -> io::Result<PathBuf> {
    let dir = profile_dir().join(profile::CACHE_DIR);
    ensure_dir(&dir)?;
    Ok(dir)
}

// 根据来源URL计算缓存文件名：<basename>_<hex(sha256[..8])>.txt
pub fn cache_file_name(url: &str) -> String {
    let base = url
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty() && *s != ".")
        .unwrap_or(external_fetch::DEFAULT_BASENAME);

    let digest = Sha256::digest(url.as_bytes());
    let mut hash = String::with_capacity(external_fetch::HASH_BYTES * 2);
    for byte in &digest[..external_fetch::HASH_BYTES] {
        hash.push_str(&format!("{:02x}", byte));
    }

    format!("{}_{}{}", base, hash, external_fetch::CACHE_FILE_SUFFIX)
}
