use tokio::sync::RwLock;

use crate::error::GatewayError;
use crate::keypool::counter::BoundedCounter;
use crate::util::rand;

/// Key 池与轮换计数器。
///
/// 计数器上界固定为 `len - 1`，序号可直接作池下标；移除 key 时在同一把
/// 写锁内重建计数器，上界不会滞后于池长度。计数器自身的读-改-写由
/// [`BoundedCounter`] 的互斥锁保护，池成员的变更与下标访问由本结构的
/// 读写锁串行化。
#[derive(Debug)]
pub struct KeyRotator {
    inner: RwLock<Inner>,
    /// 构造时的池快照，供 [`KeyRotator::restore_defaults`] 恢复。
    default_keys: Vec<String>,
}

#[derive(Debug)]
struct Inner {
    keys: Vec<String>,
    counter: BoundedCounter,
}

impl KeyRotator {
    pub fn new(keys: Vec<String>) -> Result<Self, GatewayError> {
        if keys.is_empty() {
            return Err(GatewayError::config("key 池不能为空"));
        }
        // 起始下标随机，避免多个进程实例以相同节奏从头轮换同一批 key。
        let counter = BoundedCounter::new(rand::random_below(keys.len()), keys.len() - 1)?;
        Ok(Self {
            default_keys: keys.clone(),
            inner: RwLock::new(Inner { keys, counter }),
        })
    }

    /// 自增轮换计数器并返回新值，即下一次请求使用的池下标。
    pub async fn next_index(&self) -> usize {
        self.inner.read().await.counter.increment()
    }

    /// 轮换取 key：计数器自增与取值在同一把读锁内完成，
    /// 与写锁下的移除互斥，下标不会越界。
    pub async fn current_key(&self) -> String {
        let inner = self.inner.read().await;
        let index = inner.counter.increment();
        inner.keys[index].clone()
    }

    /// 均匀随机取一个 key；独立于轮换计数器，仅用于诊断。
    pub async fn random_key(&self) -> String {
        let inner = self.inner.read().await;
        inner.keys[rand::random_below(inner.keys.len())].clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.keys.len()
    }

    /// 池内容的快照副本，用于诊断与测试断言。
    pub async fn keys(&self) -> Vec<String> {
        self.inner.read().await.keys.clone()
    }

    /// 从池中移除一个 key（通常是刚触发限流的那个）。
    ///
    /// key 不存在按契约违规报 [`GatewayError::KeyNotFound`]；
    /// 移除最后一个 key 会被拒绝，池长度保持 ≥ 1，轮换路径始终有下标可用。
    pub async fn remove(&self, key: &str) -> Result<(), GatewayError> {
        let mut inner = self.inner.write().await;
        let Some(pos) = inner.keys.iter().position(|k| k == key) else {
            return Err(GatewayError::KeyNotFound(key.to_string()));
        };
        if inner.keys.len() == 1 {
            return Err(GatewayError::config("移除会清空 key 池，已拒绝"));
        }
        inner.keys.remove(pos);
        let counter = rebind_counter(&inner.counter, inner.keys.len())?;
        inner.counter = counter;
        Ok(())
    }

    /// 把池恢复到构造时的快照，并重建计数器。
    pub async fn restore_defaults(&self) -> Result<(), GatewayError> {
        let mut inner = self.inner.write().await;
        inner.keys = self.default_keys.clone();
        let counter = rebind_counter(&inner.counter, inner.keys.len())?;
        inner.counter = counter;
        Ok(())
    }
}

/// 池长度变化后重建计数器：上界重新推导为 `len - 1`，当前值收敛进新值域。
fn rebind_counter(counter: &BoundedCounter, len: usize) -> Result<BoundedCounter, GatewayError> {
    let max_value = len - 1;
    BoundedCounter::new(counter.value().min(max_value), max_value)
}
