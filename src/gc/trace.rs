use crate::env::EnvRef;
use crate::objects::object::ObjRef;
use crate::value::Value;

/// Gray work-list. Objects and envs pushed here are marked when popped, so
/// pushing the same handle twice is harmless.
#[derive(Debug, Default)]
pub struct Tracer {
    pub(crate) objects: Vec<ObjRef>,
    pub(crate) envs: Vec<EnvRef>,
}

impl Tracer {
    pub fn new() -> Tracer {
        Tracer::default()
    }

    #[inline]
    pub fn push_object(&mut self, object: ObjRef) {
        self.objects.push(object);
    }

    #[inline]
    pub fn push_value(&mut self, value: Value) {
        if let Value::Obj(object) = value {
            self.objects.push(object);
        }
    }

    #[inline]
    pub fn push_env(&mut self, env: EnvRef) {
        self.envs.push(env);
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.envs.is_empty()
    }

    pub fn clear(&mut self) {
        self.objects.clear();
        self.envs.clear();
    }
}
