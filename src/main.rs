use anyhow::Context;
use clap::{Parser, Subcommand};
use cloudfile_uploader::{
    config::AppConfig,
    logging,
    persistence::{cleanup_invalid_sessions, scan_recoverable_sessions},
    uploader::{LoggingProgress, UploadReceipt},
    FileSessionStore, LocalDirBackend, SessionStore, StorageBackend, Uploader,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_STORE_DIR: &str = "storage";

#[derive(Parser, Debug)]
#[command(author, version, about = "Chunked multipart uploader with resumable sessions")]
struct Cli {
    /// 配置文件路径
    #[arg(long, default_value = "config/app.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a local file to the object store
    Upload {
        file: PathBuf,
        key: String,
        /// Root directory of the local object store
        #[arg(long = "store", default_value = DEFAULT_STORE_DIR)]
        store_dir: PathBuf,
        #[arg(long)]
        content_type: Option<String>,
    },
    /// Resume a persisted session, or every recoverable session when no id is given
    Resume {
        session_id: Option<String>,
        #[arg(long = "store", default_value = DEFAULT_STORE_DIR)]
        store_dir: PathBuf,
    },
    /// List persisted sessions
    List,
    /// Abort a persisted session and discard its uploaded parts
    Abort {
        session_id: String,
        #[arg(long = "store", default_value = DEFAULT_STORE_DIR)]
        store_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_or_default(&cli.config).await;
    let _log_guard = logging::init_logging(&config.log);
    info!("Cloudfile Uploader v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let chunk_config = config.chunk_config()?;
    let session_dir = config.persistence.session_dir.clone();
    let store = Arc::new(FileSessionStore::new(&session_dir));

    let expired = store
        .cleanup_expired(config.persistence.session_retention_days)
        .await?;
    if !expired.is_empty() {
        warn!(
            "已清理 {} 个过期会话（远端分片未中止）: {:?}",
            expired.len(),
            expired.iter().map(|s| &s.session_id).collect::<Vec<_>>()
        );
    }

    if config.persistence.scan_on_startup {
        let scan = scan_recoverable_sessions(&session_dir)
            .with_context(|| format!("扫描会话目录失败: {:?}", session_dir))?;
        if !scan.invalid.is_empty() {
            cleanup_invalid_sessions(&session_dir, &scan.invalid);
        }
        if scan.has_recoverable() {
            info!(
                "发现 {} 个可续传的会话，使用 `resume` 继续上传",
                scan.recoverable.len()
            );
        }
        for session in &scan.pending_abort {
            warn!(
                "会话 {} 上次中止失败 (upload_id={})，使用 `abort {}` 重试",
                session.session_id, session.upload_id, session.session_id
            );
        }
    }

    // Ctrl-C 时停止派发新分片，进行中的分片完成后保存会话
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，等待进行中的分片完成后退出");
            token.cancel();
        }
    });

    let uploader_for = |store_dir: PathBuf, label: String| {
        let backend: Arc<dyn StorageBackend> = Arc::new(LocalDirBackend::new(store_dir));
        Uploader::new(backend, chunk_config)
            .with_store(store.clone())
            .with_listener(Arc::new(LoggingProgress::new(label)))
            .with_cancel_token(cancel_token.clone())
    };

    match cli.command {
        Command::Upload {
            file,
            key,
            store_dir,
            content_type,
        } => {
            let uploader = uploader_for(store_dir, key.clone());
            let receipt = match content_type {
                Some(ct) => uploader.upload_file_with_content_type(&file, &key, &ct).await,
                None => uploader.upload_file(&file, &key).await,
            }
            .with_context(|| format!("上传 {:?} 失败", file))?;
            print_receipt(uploader.backend().as_ref(), &receipt).await?;
        }
        Command::Resume {
            session_id: Some(session_id),
            store_dir,
        } => {
            let uploader = uploader_for(store_dir, session_id.clone());
            let receipt = uploader
                .resume_by_id(&session_id)
                .await
                .with_context(|| format!("续传会话 {} 失败", session_id))?;
            print_receipt(uploader.backend().as_ref(), &receipt).await?;
        }
        Command::Resume {
            session_id: None,
            store_dir,
        } => {
            let uploader = uploader_for(store_dir, "resume".to_string());
            let results = uploader.resume_all().await?;
            if results.is_empty() {
                println!("no sessions to resume");
            }
            let mut failed = 0;
            for (session_id, result) in results {
                match result {
                    Ok(receipt) => {
                        println!("{}: completed", session_id);
                        print_receipt(uploader.backend().as_ref(), &receipt).await?;
                    }
                    Err(e) => {
                        failed += 1;
                        println!("{}: failed [{}] {}", session_id, e.code(), e);
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{} session(s) failed to resume", failed);
            }
        }
        Command::List => {
            let sessions = store.list().await?;
            if sessions.is_empty() {
                println!("no persisted sessions");
            }
            for s in sessions {
                println!(
                    "{}  {}  {}/{} parts  {:.1}%  updated {}{}",
                    s.session_id,
                    s.key,
                    s.completed_count(),
                    s.total_chunks(),
                    s.progress(),
                    s.updated_at.format("%Y-%m-%d %H:%M:%S"),
                    if s.abort_requested { "  (abort pending)" } else { "" }
                );
            }
        }
        Command::Abort {
            session_id,
            store_dir,
        } => {
            let uploader = uploader_for(store_dir, session_id.clone());
            uploader
                .abort_session(&session_id)
                .await
                .with_context(|| format!("中止会话 {} 失败", session_id))?;
            println!("{}: aborted", session_id);
        }
    }

    Ok(())
}

async fn print_receipt(backend: &dyn StorageBackend, receipt: &UploadReceipt) -> anyhow::Result<()> {
    println!(
        "{} -> {} ({:?}, {} bytes, {} parts)",
        receipt.key,
        receipt.location,
        receipt.mode,
        receipt.size,
        receipt.parts.len()
    );
    if let Some(head) = backend
        .head_object(&receipt.key)
        .await
        .context("读取对象元信息失败")?
    {
        println!("  size={} etag={}", head.size, head.etag);
    }
    Ok(())
}
