//! Built-in models the simulated controller can load.

use montecarlo_core::{Model, ModelCatalog, VariableSpec};

pub const BENEFICIO: &str = "modelo_beneficio.json";
pub const AREA: &str = "modelo_area.json";
pub const TIEMPO: &str = "modelo_tiempo.json";

/// Loads and validates, but the formula is cut short and never compiles.
pub const ROTO: &str = "modelo_roto.json";

/// Fails validation: declares no variables.
pub const INVALIDO: &str = "modelo_invalido.json";

fn var(name: &str, spec: VariableSpec) -> (String, VariableSpec) {
    (name.to_string(), spec)
}

pub fn beneficio() -> Model {
    Model::new(
        "beneficio",
        "Beneficio = ingresos - costos",
        "ingresos - costos",
        [
            var("ingresos", VariableSpec::uniform(100.0, 200.0)),
            var("costos", VariableSpec::uniform(50.0, 80.0)),
        ],
    )
}

pub fn area() -> Model {
    Model::new(
        "area",
        "Area de un circulo de radio variable",
        "3.14159 * radio ** 2",
        [var("radio", VariableSpec::normal(5.0, 1.0))],
    )
}

pub fn tiempo() -> Model {
    Model::new(
        "tiempo",
        "Tiempo de viaje = distancia / velocidad + espera",
        "distancia / velocidad + espera",
        [
            var("distancia", VariableSpec::uniform(10.0, 500.0)),
            var("velocidad", VariableSpec::uniform(40.0, 120.0)),
            var("espera", VariableSpec::exponential(0.5)),
        ],
    )
}

pub fn roto() -> Model {
    Model::new(
        "roto",
        "Formula incompleta",
        "ventas * margen -",
        [
            var("ventas", VariableSpec::uniform(100.0, 200.0)),
            var("margen", VariableSpec::uniform(0.1, 0.4)),
        ],
    )
}

/// Every built-in model, keyed by file-style reference.
pub fn builtin() -> ModelCatalog {
    ModelCatalog::new()
        .with(BENEFICIO, beneficio())
        .with(AREA, area())
        .with(TIEMPO, tiempo())
        .with(ROTO, roto())
        .with(
            INVALIDO,
            Model::new("invalido", "Sin variables", "1", Vec::<(String, VariableSpec)>::new()),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use montecarlo_core::{Formula, ModelError, ModelLoader};

    #[test]
    fn test_builtin_models_load() {
        let catalog = builtin();
        for reference in [BENEFICIO, AREA, TIEMPO, ROTO] {
            assert!(catalog.load(reference).is_ok(), "{reference}");
        }
        assert!(matches!(catalog.load(INVALIDO), Err(ModelError::NoVariables)));
    }

    #[test]
    fn test_formulas_reference_declared_variables() {
        for model in [beneficio(), area(), tiempo()] {
            let formula = Formula::parse(&model.formula).unwrap();
            let declared = model.variable_names();
            assert!(formula.variables().iter().all(|v| declared.contains(v.as_str())));
        }
        assert!(Formula::parse(&roto().formula).is_err());
    }

    #[test]
    fn test_variable_sets_differ() {
        let models = [beneficio(), area(), tiempo(), roto()];
        for (i, a) in models.iter().enumerate() {
            for b in &models[i + 1..] {
                assert_ne!(a.variable_names(), b.variable_names(), "{} vs {}", a.name, b.name);
            }
        }
    }
}
