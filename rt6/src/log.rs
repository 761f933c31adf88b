// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

macro_rules! rt6_log {
    ($log:expr, $level:ident, $module:expr, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_RT6,
            "module" => $module,
            $($key => $value),*
        )
    };
    ($log:expr, $level:ident, $module:expr, $msg:expr, $($args:expr),*; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_RT6,
            "module" => $module,
            $($key => $value),*
        )
    };
    ($log:expr, $level:ident, $module:expr, $msg:expr) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_RT6,
            "module" => $module,
        )
    };
    ($log:expr, $level:ident, $module:expr, $msg:expr, $($args:expr),*) => {
        slog::$level!($log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_RT6,
            "module" => $module,
        )
    };
}

pub(crate) use rt6_log;
