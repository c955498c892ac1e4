fn resolve_api_key() -> anyhow::Result<String> {
    if let Some(api_key) = std::env::var("KIOSK_API_KEY")
        .ok()
        .filter(|value| !value.trim().is_empty())
    {
        return Ok(api_key);
    }
    let storage = CredentialStore::new().context("failed to initialize credential storage")?;
    match storage.get_api_key() {
        Ok(api_key) => Ok(api_key),
        Err(StorageError::NotFound) => anyhow::bail!(
            "no backend API key: set KIOSK_API_KEY or run `kiosksyncd --set-api-key <key>`"
        ),
        Err(err) => Err(err).context("failed to read backend API key"),
    }
}

async fn open_store(db_path: &Path) -> anyhow::Result<QueueStore> {
    QueueStore::open(db_path)
        .await
        .with_context(|| format!("failed to open queue database at {}", db_path.display()))
}

fn resolve_db_path(value: Option<String>) -> anyhow::Result<PathBuf> {
    match value.filter(|value| !value.trim().is_empty()) {
        Some(value) => Ok(expand_with_home(&value, dirs::home_dir().as_deref())),
        None => default_db_path().context("data directory is unavailable"),
    }
}

fn expand_with_home(value: &str, home: Option<&Path>) -> PathBuf {
    match home {
        Some(home) if value == "~" => home.to_path_buf(),
        Some(home) => match value.strip_prefix("~/") {
            Some(rest) => home.join(rest),
            None => PathBuf::from(value),
        },
        None => PathBuf::from(value),
    }
}

fn routes_from<F>(lookup: &F) -> RecordRoutes
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = RecordRoutes::default();
    let route = |name: &str, default: String| {
        lookup(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or(default)
    };
    RecordRoutes {
        location: route("KIOSK_ROUTE_LOCATION", defaults.location),
        device_status: route("KIOSK_ROUTE_DEVICE_STATUS", defaults.device_status),
        verification: route("KIOSK_ROUTE_VERIFICATION", defaults.verification),
        geofence_event: route("KIOSK_ROUTE_GEOFENCE", defaults.geofence_event),
        table_prefix: route("KIOSK_ROUTE_TABLE_PREFIX", defaults.table_prefix),
    }
}

fn startup_status(config: &DaemonConfig) -> DeviceStatusReport {
    DeviceStatusReport {
        device_id: config.device_id.clone(),
        battery_percent: None,
        is_charging: false,
        network_type: config.network.as_str().to_string(),
        connectivity: if config.network.is_online() {
            "online"
        } else {
            "offline"
        }
        .to_string(),
        kiosk_locked: config.kiosk_locked,
    }
}

fn log_report(report: &SyncReport) {
    if report.auth_required {
        tracing::warn!(
            failed = report.failed,
            released = report.released,
            "backend rejected the API key, sync paused until the next pass"
        );
    } else if report.failed > 0 {
        tracing::warn!(
            failed = report.failed,
            succeeded = report.succeeded,
            "sync pass finished with permanent failures"
        );
    } else {
        tracing::debug!(
            succeeded = report.succeeded,
            retried = report.retried,
            deferred = report.deferred,
            "sync pass finished"
        );
    }
}

fn read_u64_env(value: Option<String>, default: u64) -> u64 {
    value
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(value: Option<String>, default: bool) -> bool {
    value
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}
