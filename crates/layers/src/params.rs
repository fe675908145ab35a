//! Parameter registry and forward-pass context.
//!
//! Every stateful primitive resolves its tensors through a [`Scope`], a
//! hierarchical name path into a shared [`ParamStore`]. Trainable tensors live
//! in a `candle_nn::VarMap`, so any Candle optimiser can consume them directly.
//! Running statistics and power-iteration vectors live in a separate buffer
//! table that optimisers never see. A tensor is created on the first request
//! for its path and reused afterwards; reusing a path is how weight sharing is
//! expressed.
//!
//! The execution [`Mode`] is fixed when the root scope is created and inherited
//! by every child scope, so a single forward pass cannot mix training and
//! inference behaviour.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use candle_core::{DType, Device, Error, Result, Shape, Tensor, Var};
use candle_nn::VarMap;
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{checks, init::WeightInit};

/// Whether normalisation layers use batch statistics and update running state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Training,
    Inference,
}

impl Mode {
    pub fn is_training(self) -> bool {
        matches!(self, Mode::Training)
    }
}

/// Projection applied to a trainable tensor by [`ParamStore::apply_constraints`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constraint {
    /// Clamp every element into `[min, max]`.
    Clip { min: f64, max: f64 },
}

impl Constraint {
    pub fn apply(&self, value: &Tensor) -> Result<Tensor> {
        match *self {
            Constraint::Clip { min, max } => value.clamp(min, max),
        }
    }
}

/// Store-wide defaults for parameter creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Seed for every initialiser; `None` draws from OS entropy.
    pub seed: Option<u64>,
    /// Distribution used for convolution and dense kernels.
    pub kernel_init: WeightInit,
    /// L2 penalty coefficient registered for every kernel.
    pub kernel_l2: Option<f64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            seed: None,
            kernel_init: WeightInit::default(),
            kernel_l2: Some(1e-4),
        }
    }
}

impl StoreConfig {
    /// Parses a TOML document, filling unspecified fields with defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|err| Error::Msg(format!("invalid store configuration: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if let Some(coef) = self.kernel_l2 {
            if !coef.is_finite() || coef < 0.0 {
                errors.push(format!("kernel_l2 must be a non-negative finite number, got {coef}"));
            }
        }
        match &self.kernel_init {
            WeightInit::Normal { stddev, .. } | WeightInit::TruncatedNormal { stddev, .. }
                if !(stddev.is_finite() && *stddev >= 0.0) =>
            {
                errors.push(format!("kernel_init stddev must be non-negative, got {stddev}"));
            }
            _ => {}
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Msg(errors.join("; ")))
        }
    }
}

/// Registry of every parameter and buffer created through a [`Scope`].
pub struct ParamStore {
    config: StoreConfig,
    dtype: DType,
    device: Device,
    trainable: VarMap,
    buffers: Mutex<HashMap<String, Arc<Mutex<Tensor>>>>,
    penalties: Mutex<HashMap<String, f64>>,
    constraints: Mutex<HashMap<String, Constraint>>,
    rng: Mutex<StdRng>,
}

impl fmt::Debug for ParamStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamStore")
            .field("config", &self.config)
            .field("dtype", &self.dtype)
            .field("device", &self.device)
            .finish()
    }
}

impl ParamStore {
    pub fn new(config: StoreConfig, dtype: DType, device: &Device) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            dtype,
            device: device.clone(),
            trainable: VarMap::new(),
            buffers: Mutex::new(HashMap::new()),
            penalties: Mutex::new(HashMap::new()),
            constraints: Mutex::new(HashMap::new()),
            rng: Mutex::new(rng),
        }
    }

    /// Default configuration with a fixed seed; convenient for tests.
    pub fn seeded(seed: u64, dtype: DType, device: &Device) -> Self {
        let config = StoreConfig {
            seed: Some(seed),
            ..StoreConfig::default()
        };
        Self::new(config, dtype, device)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Trainable variables, ready to hand to a `candle_nn` optimiser.
    pub fn varmap(&self) -> &VarMap {
        &self.trainable
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        self.trainable.all_vars()
    }

    /// Sorted paths of every trainable parameter.
    pub fn trainable_paths(&self) -> Result<Vec<String>> {
        let vars = lock(self.trainable.data(), "parameter")?;
        let mut paths: Vec<String> = vars.keys().cloned().collect();
        paths.sort();
        Ok(paths)
    }

    /// Sorted paths of every non-trainable buffer.
    pub fn buffer_paths(&self) -> Result<Vec<String>> {
        let buffers = lock(&self.buffers, "buffer")?;
        let mut paths: Vec<String> = buffers.keys().cloned().collect();
        paths.sort();
        Ok(paths)
    }

    /// Current value of a trainable parameter.
    pub fn parameter(&self, path: &str) -> Result<Option<Tensor>> {
        let vars = lock(self.trainable.data(), "parameter")?;
        Ok(vars.get(path).map(|var| var.as_tensor().clone()))
    }

    /// Snapshot of a buffer's current value.
    pub fn buffer(&self, path: &str) -> Result<Option<Tensor>> {
        let entry = lock(&self.buffers, "buffer")?.get(path).map(Arc::clone);
        match entry {
            Some(entry) => Ok(Some(lock(&entry, path)?.clone())),
            None => Ok(None),
        }
    }

    /// Overwrites an existing trainable parameter, keeping its shape.
    pub fn set_parameter(&self, path: &str, value: &Tensor) -> Result<()> {
        let vars = lock(self.trainable.data(), "parameter")?;
        let var = vars
            .get(path)
            .ok_or_else(|| Error::Msg(format!("unknown parameter '{path}'")))?;
        checks::expect_shape(path, value, var.dims())?;
        var.set(&value.to_dtype(var.dtype())?)
    }

    /// Sum of `coef * sum(w^2) / 2` over penalised parameters whose path
    /// contains `filter` (an empty filter selects every parameter).
    pub fn regularization_loss(&self, filter: &str) -> Result<Tensor> {
        let mut selected: Vec<(String, f64)> = lock(&self.penalties, "penalty")?
            .iter()
            .filter(|(path, _)| path.contains(filter))
            .map(|(path, coef)| (path.clone(), *coef))
            .collect();
        selected.sort_by(|a, b| a.0.cmp(&b.0));

        let vars = lock(self.trainable.data(), "parameter")?;
        let mut total = Tensor::zeros((), self.dtype, &self.device)?;
        for (path, coef) in selected {
            if let Some(var) = vars.get(&path) {
                let term = (var.as_tensor().sqr()?.sum_all()? * (0.5 * coef))?;
                total = (total + term)?;
            }
        }
        Ok(total)
    }

    /// Projects every constrained parameter back into its feasible set.
    ///
    /// Call after each optimiser step.
    pub fn apply_constraints(&self) -> Result<()> {
        let constraints: Vec<(String, Constraint)> = lock(&self.constraints, "constraint")?
            .iter()
            .map(|(path, constraint)| (path.clone(), *constraint))
            .collect();
        let vars = lock(self.trainable.data(), "parameter")?;
        for (path, constraint) in constraints {
            if let Some(var) = vars.get(&path) {
                let projected = constraint.apply(var.as_tensor())?;
                var.set(&projected)?;
            }
        }
        Ok(())
    }

    fn sample(&self, shape: &Shape, init: &WeightInit) -> Result<Tensor> {
        let mut rng = lock(&self.rng, "rng")?;
        init.sample(shape, self.dtype, &self.device, &mut *rng)
    }

    fn trainable_entry(
        &self,
        path: String,
        shape: Shape,
        init: &WeightInit,
        penalty: Option<f64>,
        constraint: Option<Constraint>,
    ) -> Result<Tensor> {
        let mut vars = lock(self.trainable.data(), "parameter")?;
        if let Some(var) = vars.get(&path) {
            expect_registered_shape(&path, var.dims(), &shape)?;
            return Ok(var.as_tensor().clone());
        }

        let var = Var::from_tensor(&self.sample(&shape, init)?)?;
        let tensor = var.as_tensor().clone();
        log::debug!("created parameter {path} with shape {:?}", shape.dims());
        vars.insert(path.clone(), var);
        drop(vars);

        if let Some(coef) = penalty {
            lock(&self.penalties, "penalty")?.insert(path.clone(), coef);
        }
        if let Some(constraint) = constraint {
            lock(&self.constraints, "constraint")?.insert(path, constraint);
        }
        Ok(tensor)
    }

    fn buffer_entry(&self, path: String, shape: Shape, init: &WeightInit) -> Result<Arc<Mutex<Tensor>>> {
        let mut buffers = lock(&self.buffers, "buffer")?;
        if let Some(entry) = buffers.get(&path) {
            let dims = lock(entry, &path)?.dims().to_vec();
            expect_registered_shape(&path, &dims, &shape)?;
            return Ok(Arc::clone(entry));
        }

        let value = self.sample(&shape, init)?;
        log::debug!("created buffer {path} with shape {:?}", shape.dims());
        let entry = Arc::new(Mutex::new(value));
        buffers.insert(path, Arc::clone(&entry));
        Ok(entry)
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| Error::Msg(format!("{what} registry mutex poisoned")))
}

fn expect_registered_shape(path: &str, registered: &[usize], requested: &Shape) -> Result<()> {
    if registered == requested.dims() {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "parameter '{path}' already registered with shape {:?}, requested {:?}",
            registered,
            requested.dims()
        )))
    }
}

/// Hierarchical naming context threaded through every layer call.
#[derive(Clone)]
pub struct Scope {
    store: Arc<ParamStore>,
    prefix: Vec<String>,
    mode: Mode,
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("prefix", &self.prefix())
            .field("mode", &self.mode)
            .finish()
    }
}

impl Scope {
    /// Root scope over `store`; `mode` applies to everything reached from it.
    pub fn new(store: Arc<ParamStore>, mode: Mode) -> Self {
        Self {
            store,
            prefix: Vec::new(),
            mode,
        }
    }

    /// Child scope one level below this one.
    pub fn pp<S: ToString>(&self, name: S) -> Self {
        let mut prefix = self.prefix.clone();
        prefix.push(name.to_string());
        Self {
            store: Arc::clone(&self.store),
            prefix,
            mode: self.mode,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_training(&self) -> bool {
        self.mode.is_training()
    }

    pub fn store(&self) -> &Arc<ParamStore> {
        &self.store
    }

    pub fn device(&self) -> &Device {
        self.store.device()
    }

    pub fn dtype(&self) -> DType {
        self.store.dtype()
    }

    /// Dot-joined prefix of this scope.
    pub fn prefix(&self) -> String {
        self.prefix.join(".")
    }

    /// Full path of `name` inside this scope.
    pub fn path(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{name}", self.prefix())
        }
    }

    /// Convolution or dense kernel using the store's initialiser and L2 penalty.
    pub fn kernel<S: Into<Shape>>(&self, name: &str, shape: S) -> Result<Tensor> {
        let config = self.store.config();
        self.store.trainable_entry(
            self.path(name),
            shape.into(),
            &config.kernel_init,
            config.kernel_l2,
            None,
        )
    }

    /// Trainable tensor with an explicit initialiser and no penalty.
    pub fn param<S: Into<Shape>>(&self, name: &str, shape: S, init: &WeightInit) -> Result<Tensor> {
        self.store
            .trainable_entry(self.path(name), shape.into(), init, None, None)
    }

    /// Trainable tensor projected by `constraint` in [`ParamStore::apply_constraints`].
    pub fn constrained_param<S: Into<Shape>>(
        &self,
        name: &str,
        shape: S,
        init: &WeightInit,
        constraint: Constraint,
    ) -> Result<Tensor> {
        self.store
            .trainable_entry(self.path(name), shape.into(), init, None, Some(constraint))
    }

    /// Snapshot of a non-trainable buffer, created from `init` on first use.
    pub fn buffer<S: Into<Shape>>(&self, name: &str, shape: S, init: &WeightInit) -> Result<Tensor> {
        let entry = self.store.buffer_entry(self.path(name), shape.into(), init)?;
        let value = lock(&entry, name)?.clone();
        Ok(value)
    }

    /// Read-modify-write of a buffer under its own lock.
    ///
    /// `update` receives the current value and returns the replacement together
    /// with an arbitrary output. No other caller observes the buffer between the
    /// read and the write-back.
    pub fn update_buffer<S, R, F>(&self, name: &str, shape: S, init: &WeightInit, update: F) -> Result<R>
    where
        S: Into<Shape>,
        F: FnOnce(&Tensor) -> Result<(Tensor, R)>,
    {
        let entry = self.store.buffer_entry(self.path(name), shape.into(), init)?;
        let mut current = lock(&entry, name)?;
        let (next, output) = update(&current)?;
        expect_registered_shape(&self.path(name), current.dims(), next.shape())?;
        *current = next.detach();
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Arc<ParamStore> {
        Arc::new(ParamStore::seeded(0, DType::F32, &Device::Cpu))
    }

    #[test]
    fn paths_are_dot_joined() {
        let root = Scope::new(store(), Mode::Training);
        let scope = root.pp("generator").pp("res_0");
        assert_eq!(scope.path("kernel"), "generator.res_0.kernel");
        assert_eq!(root.path("gamma"), "gamma");
    }

    #[test]
    fn reusing_a_path_shares_the_parameter() -> Result<()> {
        let store = store();
        let scope = Scope::new(Arc::clone(&store), Mode::Training).pp("fc");
        let a = scope.kernel("kernel", (4, 3))?;
        let b = scope.kernel("kernel", (4, 3))?;
        assert_eq!(a.id(), b.id());
        assert_eq!(store.trainable_vars().len(), 1);

        let err = scope.kernel("kernel", (3, 4)).unwrap_err();
        assert!(err.to_string().contains("already registered"));
        Ok(())
    }

    #[test]
    fn child_scopes_inherit_mode() {
        let root = Scope::new(store(), Mode::Inference);
        assert_eq!(root.pp("a").pp("b").mode(), Mode::Inference);
        assert!(!root.pp("a").is_training());
    }

    #[test]
    fn buffers_are_not_trainable() -> Result<()> {
        let store = store();
        let scope = Scope::new(Arc::clone(&store), Mode::Training);
        let mean = scope.buffer("moving_mean", 3, &WeightInit::zeros())?;
        assert_eq!(mean.to_vec1::<f32>()?, vec![0.0; 3]);
        assert!(store.trainable_vars().is_empty());
        assert_eq!(store.buffer_paths()?, vec!["moving_mean".to_string()]);
        Ok(())
    }

    #[test]
    fn update_buffer_writes_back() -> Result<()> {
        let store = store();
        let scope = Scope::new(Arc::clone(&store), Mode::Training);
        let seen = scope.update_buffer("count", 1, &WeightInit::zeros(), |current| {
            Ok(((current + 1.0)?, current.to_vec1::<f32>()?[0]))
        })?;
        assert_eq!(seen, 0.0);
        let stored = store.buffer("count")?.map(|t| t.to_vec1::<f32>()).transpose()?;
        assert_eq!(stored, Some(vec![1.0]));

        let err = scope
            .update_buffer("count", 1, &WeightInit::zeros(), |current| {
                Ok((current.broadcast_as(2)?.contiguous()?, ()))
            })
            .unwrap_err();
        assert!(err.to_string().contains("count"));
        Ok(())
    }

    #[test]
    fn regularization_loss_sums_half_squared_norms() -> Result<()> {
        let store = store();
        let scope = Scope::new(Arc::clone(&store), Mode::Training);
        scope.pp("disc").kernel("kernel", (2, 2))?;
        scope.pp("gen").kernel("kernel", (2, 2))?;
        scope.pp("disc").param("bias", 2, &WeightInit::ones())?;
        store.set_parameter("disc.kernel", &Tensor::full(2f32, (2, 2), &Device::Cpu)?)?;

        let loss = store.regularization_loss("disc")?.to_scalar::<f32>()?;
        // 1e-4 * (4 * 2^2) / 2
        assert!((loss - 8e-4).abs() < 1e-8, "loss {loss}");
        Ok(())
    }

    #[test]
    fn constraints_clip_after_updates() -> Result<()> {
        let store = store();
        let scope = Scope::new(Arc::clone(&store), Mode::Training);
        let constraint = Constraint::Clip { min: 0.0, max: 1.0 };
        scope.constrained_param("rho", 3, &WeightInit::ones(), constraint)?;
        store.set_parameter(
            "rho",
            &Tensor::from_vec(vec![1.7f32, -0.2, 0.5], 3, &Device::Cpu)?,
        )?;
        store.apply_constraints()?;
        let rho = store.parameter("rho")?.map(|t| t.to_vec1::<f32>()).transpose()?;
        assert_eq!(rho, Some(vec![1.0, 0.0, 0.5]));
        assert!(store.set_parameter("rho", &Tensor::zeros(2, DType::F32, &Device::Cpu)?).is_err());
        Ok(())
    }

    #[test]
    fn store_config_parses_toml() -> Result<()> {
        let config = StoreConfig::from_toml_str(
            r#"
            seed = 42
            kernel_l2 = 0.001

            [kernel_init]
            kind = "xavier_uniform"
            gain = 1.0
            "#,
        )?;
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.kernel_init, WeightInit::XavierUniform { gain: 1.0 });

        let defaults = StoreConfig::from_toml_str("")?;
        assert_eq!(defaults, StoreConfig::default());

        assert!(StoreConfig::from_toml_str("kernel_l2 = -1.0").is_err());
        Ok(())
    }
}
