//! SGD with momentum and decoupled weight decay over flat buffers.

use crate::{
    state::{fetch, TensorData},
    ModelError, Optimizer, StateDict,
};

pub struct Sgd {
    momentum: f32,
    weight_decay: f32,
    velocity: Vec<f32>,
    steps: u64,
}

impl Sgd {
    pub fn new(momentum: f32, weight_decay: f32) -> Self {
        Self {
            momentum,
            weight_decay,
            velocity: Vec::new(),
            steps: 0,
        }
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut [f32], grads: &[f32], lr: f32) {
        debug_assert_eq!(params.len(), grads.len());
        if self.velocity.len() != params.len() {
            self.velocity = vec![0.0; params.len()];
        }

        for ((p, g), v) in params.iter_mut().zip(grads).zip(&mut self.velocity) {
            *v = self.momentum * *v + g + self.weight_decay * *p;
            *p -= lr * *v;
        }
        self.steps += 1;
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert(
            "velocity".into(),
            TensorData::new(vec![self.velocity.len()], self.velocity.clone()),
        );
        state.insert("steps".into(), TensorData::scalar(self.steps as f32));
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), ModelError> {
        let velocity = state
            .get("velocity")
            .ok_or_else(|| ModelError::MissingTensor("velocity".into()))?;
        let steps = fetch(state, "steps", &[1])?;

        self.velocity = velocity.data.clone();
        self.steps = steps.data[0] as u64;
        Ok(())
    }
}
