use std::sync::Mutex;

use crate::error::GatewayError;

/// 有界回绕计数器：值域 `[0, max_value]`，到达边界后下一次自增回绕到 0。
///
/// 读-改-写全程持锁：并发自增不会丢失更新，也不会有两个调用者从
/// 同一次自增里观察到相同的返回值。
#[derive(Debug)]
pub struct BoundedCounter {
    max_value: usize,
    value: Mutex<usize>,
}

impl BoundedCounter {
    /// `initial` 不得大于 `max_value`（与 Python 版本的构造校验一致）。
    /// `max_value == 0` 是合法的退化形态：单 key 池会构造出它，自增恒返回 0。
    pub fn new(initial: usize, max_value: usize) -> Result<Self, GatewayError> {
        if initial > max_value {
            return Err(GatewayError::config(format!(
                "计数器初值 {initial} 超过上界 {max_value}"
            )));
        }
        Ok(Self {
            max_value,
            value: Mutex::new(initial),
        })
    }

    /// 自增并返回新值。已到达边界时回绕：重置为 0 并直接返回 0，
    /// 而不是重置后再自增（保留 Python 版本的语义，见测试）。
    pub fn increment(&self) -> usize {
        let mut value = self.lock();
        if *value < self.max_value {
            *value += 1;
        } else {
            *value = 0;
        }
        *value
    }

    pub fn reset(&self) {
        *self.lock() = 0;
    }

    pub fn value(&self) -> usize {
        *self.lock()
    }

    pub fn max_value(&self) -> usize {
        self.max_value
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, usize> {
        // 临界区内只有整数读写，没有 panic 源；锁中毒时计数值依然完好，直接取回。
        match self.value.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
