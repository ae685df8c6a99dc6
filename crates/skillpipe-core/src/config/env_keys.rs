//! 环境变量 key 常量与别名定义
//!
//! 主变量使用 `SKILLPIPE_*`，LLM 相关兼容 `OPENAI_*` 等通用名称。

/// LLM API 配置
pub mod llm {
    pub const API_BASE: &str = "SKILLPIPE_API_BASE";
    pub const API_BASE_ALIASES: &[&str] = &["OPENAI_API_BASE", "OPENAI_BASE_URL", "BASE_URL"];

    pub const API_KEY: &str = "SKILLPIPE_API_KEY";
    pub const API_KEY_ALIASES: &[&str] = &["OPENAI_API_KEY", "API_KEY"];

    pub const MODEL: &str = "SKILLPIPE_MODEL";
    pub const MODEL_ALIASES: &[&str] = &["OPENAI_MODEL", "MODEL"];

    pub const SKILLPIPE_LLM_TIMEOUT_SECS: &str = "SKILLPIPE_LLM_TIMEOUT_SECS";
}

/// 工作区、数据目录、工具目录
pub mod paths {
    pub const SKILLPIPE_WORKSPACE: &str = "SKILLPIPE_WORKSPACE";
    pub const SKILLPIPE_DATA_DIR: &str = "SKILLPIPE_DATA_DIR";
    pub const SKILLPIPE_CATALOG: &str = "SKILLPIPE_CATALOG";
}

/// 流水线调度参数
pub mod pipeline {
    pub const SKILLPIPE_TOOL_TIMEOUT_SECS: &str = "SKILLPIPE_TOOL_TIMEOUT_SECS";
    pub const SKILLPIPE_MAX_RETRIES: &str = "SKILLPIPE_MAX_RETRIES";
    pub const SKILLPIPE_MAX_PARALLEL: &str = "SKILLPIPE_MAX_PARALLEL";
    pub const SKILLPIPE_MAX_PLAN_TASKS: &str = "SKILLPIPE_MAX_PLAN_TASKS";
    pub const SKILLPIPE_LLM_PLANNING: &str = "SKILLPIPE_LLM_PLANNING";
    /// 需要确认的风险等级，逗号分隔："high" 或 "medium,high"
    pub const SKILLPIPE_CONFIRM_RISK: &str = "SKILLPIPE_CONFIRM_RISK";
}

/// 遥测存储
pub mod telemetry {
    pub const SKILLPIPE_TELEMETRY: &str = "SKILLPIPE_TELEMETRY";
}

/// 可观测性与日志
pub mod observability {
    pub const SKILLPIPE_QUIET: &str = "SKILLPIPE_QUIET";
    pub const SKILLPIPE_LOG_LEVEL: &str = "SKILLPIPE_LOG_LEVEL";
    pub const SKILLPIPE_LOG_JSON: &str = "SKILLPIPE_LOG_JSON";
    pub const SKILLPIPE_AUDIT_LOG: &str = "SKILLPIPE_AUDIT_LOG";
}
