//! 按领域分组的配置结构体
//!
//! 从环境变量加载，统一 fallback 逻辑。

use super::env_keys::{llm, observability as obv_keys, paths, pipeline, telemetry};
use super::loader::{env_bool, env_optional, env_or, env_parse, load_dotenv};
use std::path::PathBuf;

/// LLM API 配置
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl LlmConfig {
    /// 从环境变量加载，空值使用默认（会自动加载 .env）
    pub fn from_env() -> Self {
        load_dotenv();
        Self {
            api_base: env_or(llm::API_BASE, llm::API_BASE_ALIASES, || {
                "https://api.openai.com/v1".to_string()
            }),
            api_key: env_or(llm::API_KEY, llm::API_KEY_ALIASES, String::new),
            model: env_or(llm::MODEL, llm::MODEL_ALIASES, || "gpt-4o".to_string()),
            timeout_secs: env_parse(llm::SKILLPIPE_LLM_TIMEOUT_SECS, 15),
        }
    }

    /// 若 api_key 或 api_base 为空则返回 None（此时 LLM 回退路径被禁用）
    pub fn try_from_env() -> Option<Self> {
        let cfg = Self::from_env();
        if cfg.api_key.trim().is_empty() || cfg.api_base.trim().is_empty() {
            None
        } else {
            Some(cfg)
        }
    }
}

/// 工作区与数据路径配置
#[derive(Debug, Clone)]
pub struct PathsConfig {
    /// 内置文件工具允许访问的根目录
    pub workspace: PathBuf,
    /// 遥测数据目录（默认 ~/.skillpipe）
    pub data_dir: PathBuf,
    /// 默认工具目录文件
    pub catalog: Option<PathBuf>,
}

impl PathsConfig {
    pub fn from_env() -> Self {
        load_dotenv();
        let workspace = env_optional(paths::SKILLPIPE_WORKSPACE, &[])
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        let data_dir = env_optional(paths::SKILLPIPE_DATA_DIR, &[])
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);
        let catalog = env_optional(paths::SKILLPIPE_CATALOG, &[]).map(PathBuf::from);
        Self {
            workspace,
            data_dir,
            catalog,
        }
    }
}

/// ~/.skillpipe
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".skillpipe")
}

/// 流水线调度参数
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// 瞬时失败的额外重试次数
    pub max_retries: u32,
    pub tool_timeout_secs: u64,
    pub llm_timeout_secs: u64,
    /// 并发派发的任务上限
    pub max_parallel: usize,
    /// 单次规划允许的最大任务数
    pub max_plan_tasks: usize,
    /// 配置了 LLM 时是否允许 LLM 辅助拆解
    pub llm_planning: bool,
    /// 原始风险确认配置（由 sandbox 解析）
    pub confirm_risk: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            tool_timeout_secs: 30,
            llm_timeout_secs: 15,
            max_parallel: 4,
            max_plan_tasks: 8,
            llm_planning: true,
            confirm_risk: "high".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        load_dotenv();
        let d = Self::default();
        Self {
            max_retries: env_parse(pipeline::SKILLPIPE_MAX_RETRIES, d.max_retries),
            tool_timeout_secs: env_parse(pipeline::SKILLPIPE_TOOL_TIMEOUT_SECS, d.tool_timeout_secs),
            llm_timeout_secs: env_parse(llm::SKILLPIPE_LLM_TIMEOUT_SECS, d.llm_timeout_secs),
            max_parallel: env_parse(pipeline::SKILLPIPE_MAX_PARALLEL, d.max_parallel).max(1),
            max_plan_tasks: env_parse(pipeline::SKILLPIPE_MAX_PLAN_TASKS, d.max_plan_tasks).max(1),
            llm_planning: env_bool(pipeline::SKILLPIPE_LLM_PLANNING, &[], d.llm_planning),
            confirm_risk: env_or(pipeline::SKILLPIPE_CONFIRM_RISK, &[], || d.confirm_risk.clone()),
        }
    }
}

/// 遥测后端
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryBackend {
    Sqlite,
    Jsonl,
    Memory,
    Off,
}

impl TelemetryBackend {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "sqlite" | "db" => Some(Self::Sqlite),
            "jsonl" | "file" => Some(Self::Jsonl),
            "memory" | "mem" => Some(Self::Memory),
            "off" | "none" | "0" | "false" => Some(Self::Off),
            _ => None,
        }
    }
}

/// 遥测存储配置
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub backend: TelemetryBackend,
    pub data_dir: PathBuf,
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        load_dotenv();
        let raw = env_or(telemetry::SKILLPIPE_TELEMETRY, &[], || "sqlite".to_string());
        let backend = TelemetryBackend::parse(&raw).unwrap_or_else(|| {
            tracing::warn!("Unknown SKILLPIPE_TELEMETRY value '{}', using sqlite", raw);
            TelemetryBackend::Sqlite
        });
        Self {
            backend,
            data_dir: PathsConfig::from_env().data_dir,
        }
    }
}

/// 可观测性配置：quiet、log_level、log_json、audit_log
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub quiet: bool,
    pub log_level: String,
    pub log_json: bool,
    pub audit_log: Option<String>,
}

impl ObservabilityConfig {
    pub fn from_env() -> &'static Self {
        use std::sync::OnceLock;
        static CACHE: OnceLock<ObservabilityConfig> = OnceLock::new();
        CACHE.get_or_init(|| {
            load_dotenv();
            Self {
                quiet: env_bool(obv_keys::SKILLPIPE_QUIET, &[], false),
                log_level: env_or(obv_keys::SKILLPIPE_LOG_LEVEL, &[], || {
                    "skillpipe=info".to_string()
                }),
                log_json: env_bool(obv_keys::SKILLPIPE_LOG_JSON, &[], false),
                audit_log: env_optional(obv_keys::SKILLPIPE_AUDIT_LOG, &[]),
            }
        })
    }
}
