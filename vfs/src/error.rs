/// 文件系统向调用者报告的错误
///
/// 资源耗尽、数据损坏、不存在与类型不支持彼此区分，不会相互降级。
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("entry already exists")]
    AlreadyExists,
    #[error("entry not found")]
    NotFound,
    #[error("is a directory")]
    IsADirectory,
    #[error("not a directory")]
    NotADirectory,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("no space left on device")]
    NoSpace,
    /// 读写失败或元数据损坏
    #[error("i/o error")]
    Io,
    #[error("operation not supported by this node")]
    NotSupported,
    #[error("invalid arguments")]
    InvalidArgs,
    #[error("bad state")]
    BadState,
    #[error("name too long")]
    NameTooLong,
    #[error("file too large")]
    FileTooLarge,
    /// 挂载点等被占用的节点
    #[error("resource unavailable")]
    Unavailable,
}
