use anyhow::Result;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::Duration,
};

/** \brief 生成次数统计键。 */
pub const GENERATION_COUNT_KEY: &str = "GENERATION_COUNT";

/**
 * \brief 进程级数据访问句柄：启动时构建一次，注入到请求处理器。
 */
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /**
     * \brief 打开数据库文件并执行迁移。
     */
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        migrate(&conn)?;
        Ok(Self::from_connection(conn))
    }

    /**
     * \brief 内存数据库（测试用）。
     */
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Db {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /**
     * \brief 获取连接锁；锁中毒时沿用内部连接。
     */
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /**
     * \brief 在阻塞线程池中持锁执行 `f`。
     * \details 锁等待与 `retry_on_locked` 的退避睡眠都发生在阻塞线程上，异步处理器只需 await。
     */
    pub async fn call<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Connection) -> std::result::Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<anyhow::Error> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db.lock()))
            .await
            .map_err(|e| E::from(anyhow::Error::from(e)))?
    }
}

/**
 * \brief 运行数据库迁移，创建必要表结构。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
        )
    })?;
    ensure_config_description_column(conn)?;
    Ok(())
}

fn ensure_config_description_column(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare("PRAGMA table_info(app_config)")?;
    let mut rows = stmt.query([])?;
    let mut has = false;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == "description" {
            has = true;
            break;
        }
    }
    if !has {
        retry_on_locked(|| conn.execute("ALTER TABLE app_config ADD COLUMN description TEXT", []))?;
    }
    Ok(())
}

/**
 * \brief 读取配置值，不存在返回 None。
 */
pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key=?1",
        params![key],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 读取非空配置值（去除首尾空白），空字符串视为未配置。
 */
pub fn get_config_nonempty(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(get_config(conn, key)?
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty()))
}

/**
 * \brief 写入配置值（存在则覆盖）。
 */
pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<()> {
    set_config_with_description(conn, key, value, None)
}

/**
 * \brief 写入配置值并附带说明。
 */
pub fn set_config_with_description(
    conn: &Connection,
    key: &str,
    value: &str,
    description: Option<&str>,
) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO app_config (key, value, description) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value,
             description=COALESCE(excluded.description, app_config.description)",
            params![key, value, description],
        )
    })?;
    Ok(())
}

/**
 * \brief 删除配置项。
 */
pub fn delete_config(conn: &Connection, key: &str) -> Result<()> {
    retry_on_locked(|| conn.execute("DELETE FROM app_config WHERE key=?1", params![key]))?;
    Ok(())
}

/**
 * \brief 列出全部配置项（按 key 排序）。
 */
pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key ASC")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 解析布尔配置字符串：true/1/yes 为真，其余为假。
 */
pub fn parse_bool(value: &str) -> bool {
    matches!(value.trim(), "true" | "1" | "yes")
}

pub fn get_bool_config(conn: &Connection, key: &str, default: bool) -> Result<bool> {
    Ok(get_config(conn, key)?
        .map(|s| parse_bool(&s))
        .unwrap_or(default))
}

/**
 * \brief 读取遥测开关。
 */
pub fn get_telemetry_enabled(conn: &Connection) -> Result<bool> {
    get_bool_config(conn, "telemetry_enabled", false)
}

/**
 * \brief 生成次数 +1，返回累加后的值。
 */
pub fn increment_generation_count(conn: &Connection) -> Result<i64> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO app_config (key, value) VALUES (?1, '1')
         ON CONFLICT(key) DO UPDATE SET value=CAST(CAST(app_config.value AS INTEGER) + 1 AS TEXT)",
            params![GENERATION_COUNT_KEY],
        )
    })?;
    get_generation_count(conn)
}

pub fn get_generation_count(conn: &Connection) -> Result<i64> {
    Ok(get_config(conn, GENERATION_COUNT_KEY)?
        .and_then(|s| s.trim().parse::<i64>().ok())
        .unwrap_or(0))
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并进行线性退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                let backoff = Duration::from_millis(200 * (attempt as u64 + 1));
                thread::sleep(backoff);
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        migrate(&conn).expect("migrate");
        conn
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = mem_conn();
        migrate(&conn).expect("second migrate");
        set_config(&conn, "k", "v").expect("set");
        assert_eq!(get_config(&conn, "k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_config_crud() {
        let conn = mem_conn();
        assert!(get_config(&conn, "COPY_ENGINE_VENDOR").unwrap().is_none());
        set_config(&conn, "COPY_ENGINE_VENDOR", "volc").unwrap();
        set_config(&conn, "COPY_ENGINE_VENDOR", "google").unwrap();
        assert_eq!(
            get_config(&conn, "COPY_ENGINE_VENDOR").unwrap().as_deref(),
            Some("google")
        );
        set_config(&conn, "A_KEY", "  ").unwrap();
        assert!(get_config_nonempty(&conn, "A_KEY").unwrap().is_none());

        let all = list_config(&conn).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0, "A_KEY");

        delete_config(&conn, "A_KEY").unwrap();
        assert!(get_config(&conn, "A_KEY").unwrap().is_none());
    }

    #[test]
    fn test_description_preserved_on_plain_update() {
        let conn = mem_conn();
        set_config_with_description(&conn, "BLOB", "[]", Some("desc")).unwrap();
        set_config(&conn, "BLOB", "[1]").unwrap();
        let desc: Option<String> = conn
            .query_row(
                "SELECT description FROM app_config WHERE key='BLOB'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(desc.as_deref(), Some("desc"));
    }

    #[test]
    fn test_bool_parsing() {
        for v in ["true", "1", "yes", " yes "] {
            assert!(parse_bool(v), "{v}");
        }
        for v in ["false", "0", "no", "TRUE", ""] {
            assert!(!parse_bool(v), "{v}");
        }
        let conn = mem_conn();
        assert!(get_bool_config(&conn, "IMAGE_ENGINE_ENABLED", true).unwrap());
        set_config(&conn, "IMAGE_ENGINE_ENABLED", "0").unwrap();
        assert!(!get_bool_config(&conn, "IMAGE_ENGINE_ENABLED", true).unwrap());
        set_config(&conn, "telemetry_enabled", "yes").unwrap();
        assert!(get_telemetry_enabled(&conn).unwrap());
    }

    #[test]
    fn test_generation_counter() {
        let conn = mem_conn();
        assert_eq!(get_generation_count(&conn).unwrap(), 0);
        assert_eq!(increment_generation_count(&conn).unwrap(), 1);
        assert_eq!(increment_generation_count(&conn).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_call_runs_on_blocking_pool() {
        let db = Db::open_in_memory().expect("open");
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let db = db.clone();
                tokio::spawn(async move { db.call(increment_generation_count).await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        let total: i64 = db.call(|conn| get_generation_count(conn)).await.unwrap();
        assert_eq!(total, 4);

        let err = db
            .call(|conn| -> Result<()> {
                conn.execute("INSERT INTO missing_table VALUES (1)", [])?;
                Ok(())
            })
            .await;
        assert!(err.is_err());
    }

    #[test]
    fn test_db_handle_shares_connection() {
        let db = Db::open_in_memory().expect("open");
        let other = db.clone();
        set_config(&db.lock(), "k", "1").unwrap();
        assert_eq!(get_config(&other.lock(), "k").unwrap().as_deref(), Some("1"));
    }
}
