use std::collections::HashMap;

use async_trait::async_trait;

use sandsched_errors::SchedulerResult;

/// 沙箱抽象：在隔离环境里执行一条命令
///
/// 实现必须在 future 被丢弃时于有限宽限期内终止底层进程；
/// 单次调用不保证无副作用，所以重试次数必须有上限。
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// 在 image 里执行 command，成功返回标准输出
    async fn run(
        &self,
        image: &str,
        command: &str,
        args: &[String],
        environment: &HashMap<String, String>,
    ) -> SchedulerResult<String>;
}
