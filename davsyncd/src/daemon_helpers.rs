fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR_NAME)
        .join(SETTINGS_FILE_NAME)
}

fn default_media_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR_NAME)
        .join("media")
}

fn parse_backend(value: Option<&str>) -> anyhow::Result<BackendKind> {
    match value.map(str::trim) {
        None | Some("") => Ok(BackendKind::Media),
        Some(raw) => BackendKind::parse(raw)
            .with_context(|| format!("unknown DAVSYNC_BACKEND value: {raw}")),
    }
}

/// Accepts `file://` URIs, `~`-relative and plain paths.
fn resolve_target_dir(uri: &str, home: &Path) -> Option<PathBuf> {
    let uri = uri.trim();
    if uri.is_empty() {
        return None;
    }
    if uri.starts_with("file:") {
        return Url::parse(uri).ok()?.to_file_path().ok();
    }
    Some(expand_with_home(uri, home))
}

fn format_book(book: &Book) -> String {
    let location = match (book.remote_ref.is_some(), book.local_ref.is_some()) {
        (true, true) => "synced",
        (true, false) => "remote",
        (false, true) => "local",
        (false, false) => "-",
    };
    let size = if book.local_ref.is_some() {
        book.local_size
    } else {
        book.remote_size
    };
    let modified = book
        .remote_modified
        .map(httpdate::fmt_http_date)
        .unwrap_or_else(|| "-".to_string());
    let mut line = format!("{location:<6} {size:>12} {modified:<29} {}", book.name);
    if !book.status.is_empty() {
        let marker = if book.error { "error: " } else { "" };
        line.push_str(&format!("  ({marker}{})", book.status));
    }
    line
}

fn describe_summary(summary: &TransferSummary) -> String {
    format!(
        "downloaded {}, deleted {}, failed {}",
        summary.downloaded, summary.deleted, summary.failed
    )
}

fn describe_outcome(outcome: &DownloadOutcome) -> String {
    match outcome {
        DownloadOutcome::NothingToSync => "nothing to sync".to_string(),
        DownloadOutcome::Completed(summary) => describe_summary(summary),
    }
}
