use std::fmt;
use std::str::FromStr;

use sandsched_errors::SchedulerError;

/// 用户任务列表查询的分页参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    number: u32,
    rows_per_page: u32,
}

impl Page {
    pub const MAX_ROWS_PER_PAGE: u32 = 100;

    pub fn new(number: u32, rows_per_page: u32) -> Result<Self, SchedulerError> {
        if number == 0 {
            return Err(SchedulerError::validation_error("页码必须从1开始"));
        }
        if rows_per_page == 0 || rows_per_page > Self::MAX_ROWS_PER_PAGE {
            return Err(SchedulerError::validation_error(format!(
                "每页行数必须在 1..={} 之间: {rows_per_page}",
                Self::MAX_ROWS_PER_PAGE
            )));
        }
        Ok(Self {
            number,
            rows_per_page,
        })
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn rows_per_page(&self) -> u32 {
        self.rows_per_page
    }

    pub fn offset(&self) -> u32 {
        (self.number - 1) * self.rows_per_page
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            number: 1,
            rows_per_page: 10,
        }
    }
}

/// 排序字段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderField {
    CreatedAt,
    ScheduledAt,
    Status,
}

impl OrderField {
    /// 数据库列名，供存储层拼接 ORDER BY 使用
    pub fn column(&self) -> &'static str {
        match self {
            OrderField::CreatedAt => "created_at",
            OrderField::ScheduledAt => "scheduled_at",
            OrderField::Status => "status",
        }
    }
}

impl FromStr for OrderField {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "created_at" => Ok(OrderField::CreatedAt),
            "scheduled_at" => Ok(OrderField::ScheduledAt),
            "status" => Ok(OrderField::Status),
            other => Err(SchedulerError::validation_error(format!(
                "无效的排序字段: {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    Asc,
    Desc,
}

impl fmt::Display for OrderDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderDirection::Asc => f.write_str("ASC"),
            OrderDirection::Desc => f.write_str("DESC"),
        }
    }
}

/// 排序方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderBy {
    pub field: OrderField,
    pub direction: OrderDirection,
}

impl OrderBy {
    pub fn new(field: OrderField, direction: OrderDirection) -> Self {
        Self { field, direction }
    }
}

impl Default for OrderBy {
    fn default() -> Self {
        Self {
            field: OrderField::CreatedAt,
            direction: OrderDirection::Desc,
        }
    }
}
