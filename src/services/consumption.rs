/// Cumulative counter values from one meter reading row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeterValues {
    pub water: i64,
    pub elec: i64,
}

/// Per-unit utility prices taken from the room's branch.
#[derive(Debug, Clone, Copy)]
pub struct UtilityRates {
    pub water: f64,
    pub elec: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Consumption {
    pub water_unit: i64,
    pub water_cost: f64,
    pub elec_unit: i64,
    pub elec_cost: f64,
}

impl Consumption {
    pub fn total_cost(&self) -> f64 {
        self.water_cost + self.elec_cost
    }
}

/// Units consumed in the current period and their cost.
///
/// Readings are cumulative counters, so usage is the delta against the
/// previous period. A room without a previous reading (first month of
/// occupancy) bills zero units rather than the full counter value.
/// Negative deltas (meter rollback or misentry) are passed through
/// uncorrected; display layers are expected to flag them.
pub fn derive(
    current: MeterValues,
    previous: Option<MeterValues>,
    rates: UtilityRates,
) -> Consumption {
    let baseline = previous.unwrap_or(current);
    let water_unit = current.water - baseline.water;
    let elec_unit = current.elec - baseline.elec;
    Consumption {
        water_unit,
        water_cost: water_unit as f64 * rates.water,
        elec_unit,
        elec_cost: elec_unit as f64 * rates.elec,
    }
}

#[cfg(test)]
mod tests {
    use super::{derive, MeterValues, UtilityRates};

    const RATES: UtilityRates = UtilityRates {
        water: 18.0,
        elec: 7.0,
    };

    #[test]
    fn bills_the_delta_between_periods() {
        let usage = derive(
            MeterValues {
                water: 105,
                elec: 310,
            },
            Some(MeterValues {
                water: 100,
                elec: 300,
            }),
            RATES,
        );
        assert_eq!(usage.water_unit, 5);
        assert_eq!(usage.water_cost, 90.0);
        assert_eq!(usage.elec_unit, 10);
        assert_eq!(usage.elec_cost, 70.0);
        assert_eq!(usage.total_cost(), 160.0);
    }

    #[test]
    fn missing_previous_reading_bills_zero_units() {
        let usage = derive(
            MeterValues {
                water: 105,
                elec: 310,
            },
            None,
            RATES,
        );
        assert_eq!(usage.water_unit, 0);
        assert_eq!(usage.elec_unit, 0);
        assert_eq!(usage.total_cost(), 0.0);
    }

    #[test]
    fn negative_deltas_pass_through() {
        let usage = derive(
            MeterValues {
                water: 90,
                elec: 310,
            },
            Some(MeterValues {
                water: 100,
                elec: 300,
            }),
            RATES,
        );
        assert_eq!(usage.water_unit, -10);
        assert_eq!(usage.water_cost, -180.0);
        assert_eq!(usage.elec_unit, 10);
    }
}
