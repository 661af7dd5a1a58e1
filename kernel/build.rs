//! Kiwi 内核构建脚本
//!
//! 在编译前解析 Kernel.toml 配置文件并生成配置常量代码，
//! 输出到 OUT_DIR/config_gen.rs，由 src/config.rs 包含。

use std::env;
use std::fs;
use std::path::PathBuf;

/// 从 TOML 表中取整数值，不存在时使用默认值
fn get_int(root: &toml::Value, section: &str, key: &str, default: i64) -> i64 {
    root.get(section)
        .and_then(|s| s.get(key))
        .and_then(|v| v.as_integer())
        .unwrap_or(default)
}

fn get_str(root: &toml::Value, section: &str, key: &str, default: &str) -> String {
    root.get(section)
        .and_then(|s| s.get(key))
        .and_then(|v| v.as_str())
        .unwrap_or(default)
        .to_string()
}

fn main() {
    println!("cargo:rerun-if-changed=Kernel.toml");

    // 解析 Kernel.toml（缺失时全部使用默认值）
    let root: toml::Value = fs::read_to_string("Kernel.toml")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(toml::Value::Table(toml::map::Map::new()));

    let name = get_str(&root, "general", "name", "Kiwi");
    let version = get_str(&root, "general", "version", "0.1.0");
    let heap_size = get_int(&root, "memory", "kernel_heap_size", 8 * 1024 * 1024);
    let page_size = get_int(&root, "memory", "page_size", 4096);
    let max_cpus = get_int(&root, "smp", "max_cpus", 8);
    let priority_count = get_int(&root, "sched", "priority_count", 32);
    let base_timeslice = get_int(&root, "sched", "base_timeslice_ns", 3_000_000);
    let max_penalty = get_int(&root, "sched", "max_penalty", 5);
    let process_limit = get_int(&root, "proc", "process_limit", 256);
    let handle_table_size = get_int(&root, "handle", "table_size", 512);

    let mut out = String::new();
    out.push_str("// 由 build.rs 根据 Kernel.toml 自动生成，请勿手动修改\n\n");
    out.push_str(&format!("/// 内核名称\npub const KERNEL_NAME: &str = \"{}\";\n\n", name));
    out.push_str(&format!("/// 内核版本\npub const KERNEL_VERSION: &str = \"{}\";\n\n", version));
    out.push_str(&format!("/// 内核堆大小（字节）\npub const KERNEL_HEAP_SIZE: usize = {};\n\n", heap_size));
    out.push_str(&format!("/// 页大小\npub const PAGE_SIZE: usize = {};\n\n", page_size));
    out.push_str(&format!("/// 最大 CPU 数量\npub const MAX_CPUS: usize = {};\n\n", max_cpus));
    out.push_str(&format!("/// 调度器优先级数量\npub const PRIORITY_COUNT: usize = {};\n\n", priority_count));
    out.push_str(&format!("/// 基础时间片（纳秒）\npub const BASE_TIMESLICE: u64 = {};\n\n", base_timeslice));
    out.push_str(&format!("/// CPU 密集型线程的最大优先级惩罚\npub const MAX_PENALTY: u8 = {};\n\n", max_penalty));
    out.push_str(&format!("/// 进程数量上限\npub const PROCESS_LIMIT: usize = {};\n\n", process_limit));
    out.push_str(&format!("/// 每进程句柄表大小\npub const HANDLE_TABLE_SIZE: usize = {};\n", handle_table_size));

    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set"));
    fs::write(out_dir.join("config_gen.rs"), out).expect("write config_gen.rs");
}
