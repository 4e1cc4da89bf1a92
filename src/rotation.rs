use crate::config::{Profile, StreamConfig};

/// 环形下标：advance 返回是否绕回起点
/// (档位绕回一圈时，监督器才轮换到下一个推流地址)
#[derive(Debug, Clone, Copy)]
pub struct Rotation {
    index: usize,
    len: usize,
}

impl Rotation {
    pub fn new(len: usize) -> Self {
        Self { index: 0, len }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// 前进一格，绕回起点时返回 true
    pub fn advance(&mut self) -> bool {
        if self.len == 0 {
            return false;
        }
        self.index = (self.index + 1) % self.len;
        self.index == 0
    }

}

/// 档位/地址/源三个维度的轮换表，纯查表无副作用
pub struct RotationTables {
    profiles: Vec<Profile>,
    endpoints: Vec<String>,
    sources: Vec<String>,
    stream_key: String,
    pub profile: Rotation,
    pub endpoint: Rotation,
    pub source: Rotation,
}

impl RotationTables {
    pub fn new(cfg: &StreamConfig) -> Self {
        Self {
            profile: Rotation::new(cfg.profiles.len()),
            endpoint: Rotation::new(cfg.endpoints.len()),
            source: Rotation::new(cfg.sources.len()),
            profiles: cfg.profiles.clone(),
            endpoints: cfg.endpoints.clone(),
            sources: cfg.sources.clone(),
            stream_key: cfg.stream_key.clone(),
        }
    }

    pub fn current_profile(&self) -> &Profile {
        &self.profiles[self.profile.index()]
    }

    /// 最保守档位 (表中最后一项)，降级模式专用
    pub fn conservative_profile(&self) -> &Profile {
        self.profiles.last().expect("profile table must not be empty")
    }

    pub fn current_endpoint(&self) -> &str {
        &self.endpoints[self.endpoint.index()]
    }

    pub fn current_source(&self) -> &str {
        &self.sources[self.source.index()]
    }

    /// 完整推流目标：endpoint + "/" + stream key
    pub fn destination(&self) -> String {
        format!(
            "{}/{}",
            self.current_endpoint().trim_end_matches('/'),
            self.stream_key
        )
    }
}
