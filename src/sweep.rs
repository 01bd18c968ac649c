//! Composable parameter sweeps.
//!
//! `sweep("x", set_x, points).nest(vec![measure("a", get_a), measure("b", get_b)])`
//! sets `x` to every point and, at each one, measures `a` then `b`. Every
//! measurement produces one row holding the measured value and the values of
//! all enclosing sweeps.

use anyhow::{anyhow, Result};
use log::{debug, info};
use std::collections::BTreeMap;

/// Column name and value pairs, outermost sweep first.
pub type Row = Vec<(String, f64)>;

type Setter = Box<dyn FnMut(f64) -> Result<()>>;
type Getter = Box<dyn FnMut() -> Result<f64>>;
type SetPoints = Box<dyn Fn() -> Vec<f64>>;
pub type Action = Box<dyn FnMut() -> Result<()>>;

/// A parameter stepped through a list of set points.
pub struct Sweep {
    name: String,
    set: Setter,
    points: SetPoints,
}

impl Sweep {
    /// Runs `children` in order at every set point.
    pub fn nest(self, children: Vec<SweepObject>) -> SweepObject {
        SweepObject::Nest(self, Box::new(SweepObject::Chain(children)))
    }
}

pub enum SweepObject {
    Sweep(Sweep),
    Nest(Sweep, Box<SweepObject>),
    Measure { name: String, get: Getter },
    Call(Action),
    Chain(Vec<SweepObject>),
}

impl From<Sweep> for SweepObject {
    fn from(sweep: Sweep) -> Self {
        SweepObject::Sweep(sweep)
    }
}

/// Sweeps `name` over fixed set points.
pub fn sweep(
    name: &str,
    set: impl FnMut(f64) -> Result<()> + 'static,
    points: Vec<f64>,
) -> Sweep {
    sweep_with(name, set, move || points.clone())
}

/// Sweeps `name` over set points computed when the sweep starts.
pub fn sweep_with(
    name: &str,
    set: impl FnMut(f64) -> Result<()> + 'static,
    points: impl Fn() -> Vec<f64> + 'static,
) -> Sweep {
    Sweep {
        name: name.to_string(),
        set: Box::new(set),
        points: Box::new(points),
    }
}

pub fn measure(name: &str, get: impl FnMut() -> Result<f64> + 'static) -> SweepObject {
    SweepObject::Measure {
        name: name.to_string(),
        get: Box::new(get),
    }
}

/// Runs `action` without recording anything.
pub fn call(action: impl FnMut() -> Result<()> + 'static) -> SweepObject {
    SweepObject::Call(Box::new(action))
}

pub fn chain(children: Vec<SweepObject>) -> SweepObject {
    SweepObject::Chain(children)
}

impl SweepObject {
    /// Walks the sweep, handing every produced row to `emit`.
    pub fn run(&mut self, emit: &mut dyn FnMut(Row) -> Result<()>) -> Result<()> {
        match self {
            SweepObject::Sweep(sweep) => {
                for point in (sweep.points)() {
                    (sweep.set)(point)?;
                    emit(vec![(sweep.name.clone(), point)])?;
                }
            }
            SweepObject::Nest(sweep, inner) => {
                let name = sweep.name.clone();
                for point in (sweep.points)() {
                    (sweep.set)(point)?;
                    let mut prefixed = |mut row: Row| {
                        row.insert(0, (name.clone(), point));
                        emit(row)
                    };
                    inner.run(&mut prefixed)?;
                }
            }
            SweepObject::Measure { name, get } => emit(vec![(name.clone(), get()?)])?,
            SweepObject::Call(action) => action()?,
            SweepObject::Chain(children) => {
                for child in children.iter_mut() {
                    child.run(emit)?;
                }
            }
        }
        Ok(())
    }
}

/// Sink for the rows of an experiment.
pub trait DataSaver {
    fn add_result(&mut self, row: &[(String, f64)]) -> Result<()>;
}

/// Rows grouped by the set of columns they carry.
#[derive(Debug, Default, Clone)]
pub struct Dataset {
    layouts: Vec<Layout>,
}

#[derive(Debug, Clone)]
struct Layout {
    /// Sorted column names.
    names: Vec<String>,
    columns: BTreeMap<String, Vec<f64>>,
}

impl Dataset {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.layouts
            .iter()
            .map(|l| l.columns.values().next().map_or(0, Vec::len))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted column names of every layout, in the order they first appeared.
    pub fn layouts(&self) -> Vec<Vec<String>> {
        self.layouts.iter().map(|l| l.names.clone()).collect()
    }

    /// Returns every column of the first layout whose sorted names begin
    /// with the sorted names in the comma separated `layout`.
    pub fn get(&self, layout: &str) -> Result<BTreeMap<String, Vec<f64>>> {
        let mut wanted: Vec<String> = layout.split(',').map(|s| s.trim().to_string()).collect();
        wanted.sort();
        self.layouts
            .iter()
            .find(|l| l.names.starts_with(&wanted))
            .map(|l| l.columns.clone())
            .ok_or_else(|| anyhow!("no such layout {wanted:?}"))
    }
}

impl DataSaver for Dataset {
    fn add_result(&mut self, row: &[(String, f64)]) -> Result<()> {
        let mut names: Vec<String> = row.iter().map(|(name, _)| name.clone()).collect();
        names.sort();
        if names.windows(2).any(|w| w[0] == w[1]) {
            return Err(anyhow!("duplicate column in row {names:?}"));
        }
        let index = match self.layouts.iter().position(|l| l.names == names) {
            Some(index) => index,
            None => {
                debug!("new layout {names:?}");
                self.layouts.push(Layout {
                    names,
                    columns: BTreeMap::new(),
                });
                self.layouts.len() - 1
            }
        };
        let layout = &mut self.layouts[index];
        for (name, value) in row {
            layout.columns.entry(name.clone()).or_default().push(*value);
        }
        Ok(())
    }
}

/// Runs `setup`, then every row of `sweep` into `saver`, then `cleanup`.
/// Cleanup actions run even if the sweep fails.
pub fn do_experiment<S: DataSaver>(
    sweep: &mut SweepObject,
    setup: Vec<Action>,
    cleanup: Vec<Action>,
    mut saver: S,
) -> Result<S> {
    for mut action in setup {
        action()?;
    }

    let mut rows = 0usize;
    let result = sweep.run(&mut |row| {
        rows += 1;
        saver.add_result(&row)
    });

    for mut action in cleanup {
        action()?;
    }
    result?;
    info!("experiment finished with {rows} rows");
    Ok(saver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::Cell, rc::Rc};

    #[test]
    fn nested_sweep_prefixes_rows() {
        let x = Rc::new(Cell::new(0.0));
        let set_x = Rc::clone(&x);
        let get_a = Rc::clone(&x);
        let get_b = Rc::clone(&x);

        let mut experiment = sweep(
            "x",
            move |v| {
                set_x.set(v);
                Ok(())
            },
            vec![1.0, 2.0, 3.0],
        )
        .nest(vec![
            measure("a", move || Ok(get_a.get() * 10.0)),
            measure("b", move || Ok(-get_b.get())),
        ]);

        let mut rows = Vec::new();
        experiment
            .run(&mut |row| {
                rows.push(row);
                Ok(())
            })
            .unwrap();
        assert_eq!(rows.len(), 6);
        assert_eq!(rows[0], vec![("x".to_string(), 1.0), ("a".to_string(), 10.0)]);
        assert_eq!(rows[5], vec![("x".to_string(), 3.0), ("b".to_string(), -3.0)]);
    }

    #[test]
    fn two_level_nesting() {
        let mut experiment = sweep("outer", |_| Ok(()), vec![0.0, 1.0]).nest(vec![sweep(
            "inner",
            |_| Ok(()),
            vec![5.0, 6.0],
        )
        .nest(vec![measure("m", || Ok(42.0))])]);

        let dataset = do_experiment(&mut experiment, vec![], vec![], Dataset::new()).unwrap();
        let data = dataset.get("m,outer").unwrap();
        assert_eq!(data["outer"], vec![0.0, 0.0, 1.0, 1.0]);
        assert_eq!(data["inner"], vec![5.0, 6.0, 5.0, 6.0]);
        assert_eq!(data["m"], vec![42.0; 4]);
    }

    #[test]
    fn chain_runs_children_in_order() {
        let mut experiment = chain(vec![
            measure("a", || Ok(1.0)),
            sweep("x", |_| Ok(()), vec![7.0]).into(),
            measure("a", || Ok(2.0)),
        ]);
        let mut rows = Vec::new();
        experiment
            .run(&mut |row| {
                rows.push(row);
                Ok(())
            })
            .unwrap();
        assert_eq!(
            rows,
            vec![
                vec![("a".to_string(), 1.0)],
                vec![("x".to_string(), 7.0)],
                vec![("a".to_string(), 2.0)],
            ]
        );
    }

    #[test]
    fn calls_emit_nothing() {
        let count = Rc::new(Cell::new(0));
        let counted = Rc::clone(&count);
        let mut experiment = sweep("x", |_| Ok(()), vec![1.0, 2.0]).nest(vec![call(move || {
            counted.set(counted.get() + 1);
            Ok(())
        })]);
        let dataset = do_experiment(&mut experiment, vec![], vec![], Dataset::new()).unwrap();
        assert!(dataset.is_empty());
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn set_points_are_computed_lazily() {
        let limit = Rc::new(Cell::new(2));
        let points_limit = Rc::clone(&limit);
        let mut experiment: SweepObject = sweep_with("n", |_| Ok(()), move || {
            (0..points_limit.get()).map(f64::from).collect()
        })
        .into();
        limit.set(4);
        let dataset = do_experiment(&mut experiment, vec![], vec![], Dataset::new()).unwrap();
        assert_eq!(dataset.get("n").unwrap()["n"], vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn layouts_are_kept_apart() {
        let mut experiment = sweep("x", |_| Ok(()), vec![1.0])
            .nest(vec![measure("a", || Ok(1.0)), measure("b", || Ok(2.0))]);
        let dataset = do_experiment(&mut experiment, vec![], vec![], Dataset::new()).unwrap();
        assert_eq!(
            dataset.layouts(),
            vec![
                vec!["a".to_string(), "x".to_string()],
                vec!["b".to_string(), "x".to_string()]
            ]
        );
        assert_eq!(dataset.get("b").unwrap()["b"], vec![2.0]);
        assert!(dataset.get("c").is_err());
        // "x" alone is not a prefix of ["a", "x"]
        assert!(dataset.get("x").is_err());
    }

    #[test]
    fn cleanup_runs_after_failure() {
        let cleaned = Rc::new(Cell::new(false));
        let flag = Rc::clone(&cleaned);
        let set_up = Rc::new(Cell::new(false));
        let setup_flag = Rc::clone(&set_up);

        let mut experiment = sweep("x", |_| Ok(()), vec![1.0, 2.0]).nest(vec![measure("m", || {
            Err(anyhow!("instrument timed out"))
        })]);
        let result = do_experiment(
            &mut experiment,
            vec![Box::new(move || {
                setup_flag.set(true);
                Ok(())
            })],
            vec![Box::new(move || {
                flag.set(true);
                Ok(())
            })],
            Dataset::new(),
        );
        assert!(result.is_err());
        assert!(set_up.get());
        assert!(cleaned.get());
    }
}
