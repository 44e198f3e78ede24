use std::collections::HashMap;
use std::hash::Hash;

use crate::error::Result;

/// Identity of a compiled shader, stable across the shader's lifetime and
/// never reused while any cache still references it.
pub type ShaderId = u64;

/// Cache keys that embed the shader they were built from, so destroying a
/// shader can evict exactly its pipelines. Each engine defines its own
/// key type around the state it bakes into native pipelines.
pub trait ShaderKeyed {
    fn shader_id(&self) -> ShaderId;
}

/// Pipeline cache shared by the engines. The key type decides how much
/// fixed-function state each engine bakes into a native pipeline; the
/// eviction contract is identical for all of them.
pub struct PipelineCache<K, P> {
    entries: HashMap<K, P>,
}

impl<K: ShaderKeyed + Hash + Eq, P> Default for PipelineCache<K, P> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K: ShaderKeyed + Hash + Eq + Clone, P> PipelineCache<K, P> {
    /// Returns the pipeline for `key`, building it on first use.
    pub fn get_or_try_insert(
        &mut self,
        key: K,
        build: impl FnOnce() -> Result<P>,
    ) -> Result<&P> {
        use std::collections::hash_map::Entry;
        match self.entries.entry(key) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => Ok(e.insert(build()?)),
        }
    }

    /// Removes and returns every pipeline built from `shader`, so the
    /// engine can destroy the native objects. Pipelines of other shaders
    /// are untouched.
    pub fn evict_shader(&mut self, shader: ShaderId) -> Vec<P> {
        let keys: Vec<_> = self
            .entries
            .keys()
            .filter(|k| k.shader_id() == shader)
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|k| self.entries.remove(&k))
            .collect()
    }

    pub fn drain(&mut self) -> Vec<P> {
        self.entries.drain().map(|(_, p)| p).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlendFactor, BlendMode, CullMode, PipelineState, Topology};

    #[derive(Clone, Copy, PartialEq, Eq, Hash)]
    struct Key {
        shader: ShaderId,
        state: PipelineState,
    }

    impl Key {
        fn new(shader: ShaderId, state: PipelineState) -> Self {
            Self { shader, state }
        }
    }

    impl ShaderKeyed for Key {
        fn shader_id(&self) -> ShaderId {
            self.shader
        }
    }

    #[test]
    fn one_pipeline_per_distinct_key() {
        let mut cache: PipelineCache<Key, u32> = PipelineCache::default();
        let mut builds = 0;

        let base = PipelineState::default();
        let culled = PipelineState {
            cull_mode: CullMode::Back,
            ..base
        };

        for _ in 0..3 {
            for state in [base, culled] {
                cache
                    .get_or_try_insert(Key::new(1, state), || {
                        builds += 1;
                        Ok(builds)
                    })
                    .unwrap();
            }
        }

        assert_eq!(builds, 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn eviction_only_touches_the_named_shader() {
        let mut cache: PipelineCache<Key, &str> = PipelineCache::default();
        let base = PipelineState::default();
        let blended = PipelineState {
            blend: Some(BlendMode::new(BlendFactor::SrcAlpha, BlendFactor::InvSrcAlpha)),
            ..base
        };
        cache.get_or_try_insert(Key::new(1, base), || Ok("a")).unwrap();
        cache.get_or_try_insert(Key::new(1, blended), || Ok("b")).unwrap();
        cache.get_or_try_insert(Key::new(2, base), || Ok("c")).unwrap();

        let evicted = cache.evict_shader(1);
        assert_eq!(evicted.len(), 2);
        assert_eq!(cache.len(), 1);

        // A recreated shader with the same id starts cold.
        let mut rebuilt = false;
        cache
            .get_or_try_insert(Key::new(1, base), || {
                rebuilt = true;
                Ok("a2")
            })
            .unwrap();
        assert!(rebuilt);
    }

    #[test]
    fn topology_changes_split_pipelines() {
        let mut cache: PipelineCache<Key, u32> = PipelineCache::default();
        let strip = PipelineState {
            topology: Topology::TriangleStrip,
            ..PipelineState::default()
        };
        cache
            .get_or_try_insert(Key::new(5, PipelineState::default()), || Ok(0))
            .unwrap();
        cache.get_or_try_insert(Key::new(5, strip), || Ok(1)).unwrap();
        assert_eq!(cache.len(), 2);
    }
}
