use crate::geometry::pixel::Pixel;
use ndarray::{Array3, Array4, ArrayView3, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Position of the module axis in a dense four-dimensional module stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleAxis {
    /// `(modules, pulses, h, w)`, as delivered by file readers.
    ModulesFirst,
    /// `(pulses, modules, h, w)`, as delivered by the online bridge.
    PulsesFirst,
}

impl ModuleAxis {
    pub fn module_axis(self) -> Axis {
        match self {
            ModuleAxis::ModulesFirst => Axis(0),
            ModuleAxis::PulsesFirst => Axis(1),
        }
    }

    pub fn pulse_axis(self) -> Axis {
        match self {
            ModuleAxis::ModulesFirst => Axis(1),
            ModuleAxis::PulsesFirst => Axis(0),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ViewError {
    #[error("module {module}: expected stack shape {expected:?}, found {found:?}")]
    ShapeMismatch {
        module: usize,
        expected: [usize; 3],
        found: Vec<usize>,
    },
    #[error("module index {module} out of range for a {n_modules}-module detector")]
    ModuleOutOfRange { module: usize, n_modules: usize },
}

/// Read-only four-dimensional view over independently stored module stacks.
///
/// Each entry holds one module's `(pulses, h, w)` stack. Modules absent from
/// the mapping read as `fill`. The dense array is only built on the first call
/// to [`StackedModuleView::materialize`] and then cached for the lifetime of
/// the view.
#[derive(Debug)]
pub struct StackedModuleView<T> {
    modules: BTreeMap<usize, Array3<T>>,
    n_modules: usize,
    stack_shape: [usize; 3],
    fill: T,
    order: ModuleAxis,
    dense: OnceLock<Array4<T>>,
}

impl<T: Pixel> StackedModuleView<T> {
    pub fn new<I>(
        modules: I,
        n_modules: usize,
        stack_shape: [usize; 3],
        fill: T,
        order: ModuleAxis,
    ) -> Result<Self, ViewError>
    where
        I: IntoIterator<Item = (usize, Array3<T>)>,
    {
        let mut map = BTreeMap::new();
        for (module, stack) in modules {
            if module >= n_modules {
                return Err(ViewError::ModuleOutOfRange { module, n_modules });
            }
            if stack.shape() != stack_shape {
                return Err(ViewError::ShapeMismatch {
                    module,
                    expected: stack_shape,
                    found: stack.shape().to_vec(),
                });
            }
            map.insert(module, stack);
        }

        Ok(Self {
            modules: map,
            n_modules,
            stack_shape,
            fill,
            order,
            dense: OnceLock::new(),
        })
    }

    /// Logical shape under the configured axis order.
    pub fn shape(&self) -> [usize; 4] {
        let [pulses, h, w] = self.stack_shape;
        match self.order {
            ModuleAxis::ModulesFirst => [self.n_modules, pulses, h, w],
            ModuleAxis::PulsesFirst => [pulses, self.n_modules, h, w],
        }
    }

    pub fn order(&self) -> ModuleAxis {
        self.order
    }

    pub fn n_modules(&self) -> usize {
        self.n_modules
    }

    pub fn pulse_count(&self) -> usize {
        self.stack_shape[0]
    }

    pub fn module_shape(&self) -> (usize, usize) {
        (self.stack_shape[1], self.stack_shape[2])
    }

    pub fn fill(&self) -> T {
        self.fill
    }

    /// Indices of the modules actually present, ascending.
    pub fn present_modules(&self) -> impl Iterator<Item = usize> + '_ {
        self.modules.keys().copied()
    }

    /// Every module index has a stack; nothing reads as fill.
    pub fn is_complete(&self) -> bool {
        self.modules.len() == self.n_modules
    }

    /// Borrow one module's stack without copying.
    pub fn module(&self, index: usize) -> Option<ArrayView3<'_, T>> {
        self.modules.get(&index).map(|stack| stack.view())
    }

    /// Element access with dense-array semantics; `None` when out of bounds.
    pub fn get(&self, index: [usize; 4]) -> Option<T> {
        let shape = self.shape();
        if index.iter().zip(shape.iter()).any(|(i, n)| i >= n) {
            return None;
        }
        let (module, pulse) = match self.order {
            ModuleAxis::ModulesFirst => (index[0], index[1]),
            ModuleAxis::PulsesFirst => (index[1], index[0]),
        };
        Some(match self.modules.get(&module) {
            Some(stack) => stack[[pulse, index[2], index[3]]],
            None => self.fill,
        })
    }

    pub fn is_materialized(&self) -> bool {
        self.dense.get().is_some()
    }

    /// Dense copy of the whole view, built once.
    pub fn materialize(&self) -> &Array4<T> {
        self.dense.get_or_init(|| {
            let mut dense = Array4::from_elem(self.shape(), self.fill);
            let axis = self.order.module_axis();
            for (&module, stack) in &self.modules {
                dense.index_axis_mut(axis, module).assign(stack);
            }
            dense
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn view(order: ModuleAxis) -> StackedModuleView<f32> {
        let modules = vec![
            (0, Array3::from_elem((2, 3, 4), 1.0)),
            (2, Array3::from_shape_fn((2, 3, 4), |(p, r, c)| (p * 100 + r * 10 + c) as f32)),
        ];
        StackedModuleView::new(modules, 3, [2, 3, 4], f32::NAN, order).unwrap()
    }

    #[test]
    fn shape_follows_axis_order() {
        assert_eq!(view(ModuleAxis::ModulesFirst).shape(), [3, 2, 3, 4]);
        assert_eq!(view(ModuleAxis::PulsesFirst).shape(), [2, 3, 3, 4]);
    }

    #[test]
    fn missing_module_reads_fill() {
        let v = view(ModuleAxis::PulsesFirst);
        assert!(v.get([0, 1, 0, 0]).unwrap().is_nan());
        assert_eq!(v.get([1, 2, 2, 3]), Some(123.0));
        assert_eq!(v.get([2, 0, 0, 0]), None);
    }

    #[test]
    fn rejects_mismatched_stack() {
        let err = StackedModuleView::new(
            vec![(1, Array3::<f32>::zeros((2, 3, 5)))],
            4,
            [2, 3, 4],
            f32::NAN,
            ModuleAxis::ModulesFirst,
        )
        .unwrap_err();
        assert_eq!(
            err,
            ViewError::ShapeMismatch {
                module: 1,
                expected: [2, 3, 4],
                found: vec![2, 3, 5],
            }
        );
    }

    #[test]
    fn rejects_module_outside_detector() {
        let err = StackedModuleView::new(
            vec![(4, Array3::<u16>::zeros((1, 1, 1)))],
            4,
            [1, 1, 1],
            0,
            ModuleAxis::ModulesFirst,
        )
        .unwrap_err();
        assert!(matches!(err, ViewError::ModuleOutOfRange { module: 4, .. }));
    }

    #[test]
    fn materializes_once_and_matches_element_access() {
        let v = view(ModuleAxis::ModulesFirst);
        assert!(!v.is_materialized());
        let first = v.materialize() as *const _;
        let second = v.materialize() as *const _;
        assert_eq!(first, second);

        let dense = v.materialize();
        for ((m, p, r, c), value) in dense.indexed_iter() {
            let expected = v.get([m, p, r, c]).unwrap();
            assert!(value == &expected || (value.is_nan() && expected.is_nan()));
        }
    }
}
